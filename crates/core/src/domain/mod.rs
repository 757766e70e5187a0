pub mod action;
pub mod request;
pub mod workflow;

pub(crate) fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
