#![forbid(unsafe_code)]

pub mod attempt;
pub mod cleanup;
pub mod files;
pub mod lock;
pub mod model;
pub mod report;
pub mod storage;

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}
