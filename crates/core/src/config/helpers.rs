use std::env;
use std::str::FromStr;

use tracing::warn;

/// Read `name` and parse it, ignoring (with a warning) values that don't parse.
pub(super) fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok().filter(|s| !s.is_empty())?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Apply `name` to `slot` when set and parsable.
pub(super) fn override_from_env<T: FromStr>(name: &str, slot: &mut T) {
    if let Some(v) = env_parse(name) {
        *slot = v;
    }
}
