use chrono::{DateTime, TimeZone};

/// Recording file base name: lower-cased pipeline id followed by the local
/// ISO-8601 timestamp at second precision, e.g. `p1-2023-05-04-13:37:00`.
pub fn segment_file_name<Tz: TimeZone>(config_id: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}-{}",
        config_id.to_lowercase(),
        at.format("%Y-%m-%d-%H:%M:%S")
    )
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs > 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

pub fn validate_bundle_url(url: &str) -> Result<(), String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err("Bundle URL must start with http:// or https://".to_string())
    }
}
