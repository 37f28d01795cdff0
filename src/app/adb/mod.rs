pub mod parse;
pub mod runner;

pub const ADB_PATH_ENV: &str = "APP_TRAVERSER_ADB";

/// Picks the adb executable: env override, then configured path (quotes stripped), then `adb`.
pub fn resolve_adb_program(configured: &str) -> String {
    if let Ok(value) = std::env::var(ADB_PATH_ENV) {
        let value = strip_quotes(&value);
        if !value.is_empty() {
            return value;
        }
    }
    let configured = strip_quotes(configured);
    if configured.is_empty() {
        "adb".to_string()
    } else {
        configured
    }
}

fn strip_quotes(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}
