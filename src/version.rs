const fn unwrap_or_cargo_version(opt: Option<&'static str>) -> &'static str {
    match opt {
        Some(val) => val,
        None => env!("CARGO_PKG_VERSION"),
    }
}

/// Release version, overridable at build time through `CONNWATCH_VERSION`.
pub const VERSION: &str = unwrap_or_cargo_version(option_env!("CONNWATCH_VERSION"));

/// User agent sent by web probes and the HTTP sink.
pub fn user_agent() -> String {
    format!("connwatch/{VERSION}")
}
