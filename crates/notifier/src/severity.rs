//! Maps a flood severity level to the email subject line and the colour of the
//! flood-map button.

/// Subject and button colour for one severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityStyle {
    pub subject: &'static str,
    pub colour: &'static str,
}

/// Classify a severity level (1 = most severe). Unknown levels get a neutral style.
pub fn classify(severity_level: i64) -> SeverityStyle {
    let (subject, colour) = match severity_level {
        1 => ("Automated Flood Notification - Severe", "#ff0000"),
        2 => ("Automated Flood Notification - Warning", "#ff751a"),
        3 => ("Automated Flood Notification - Alert", "#ffcc00"),
        4 => (
            "Automated Flood Notification - No longer in force",
            "#0099cc",
        ),
        _ => ("No subject", "#ffffff"),
    };

    SeverityStyle { subject, colour }
}
