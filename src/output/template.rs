use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};

/// Values substituted into an output filename template.
#[derive(Debug, Clone, Copy)]
pub struct FilenameContext {
    pub now: DateTime<Utc>,
    pub frequency_a: f64,
    /// Only set in dual tuner mode.
    pub frequency_b: Option<f64>,
}

impl FilenameContext {
    fn frequency(&self, scale: f64, suffix: &str) -> String {
        let a = self.frequency_a / scale;
        match self.frequency_b {
            Some(b) if b != self.frequency_a => format!("{:.0}{suffix}-{:.0}{suffix}", a, b / scale),
            _ => format!("{a:.0}{suffix}"),
        }
    }
}

/// Expands `{TIMESTAMP}`, `{TSISO8601}`, `{LOCALTIME}`, `{FREQ}`,
/// `{FREQHZ}` and `{FREQKHZ}`. Anything else is copied as is.
pub fn expand_template(template: &str, ctx: &FilenameContext) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;
    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let (value, len) = if rest.starts_with("{TIMESTAMP}") {
            (ctx.now.format("%Y%m%d_%H%M%SZ").to_string(), "{TIMESTAMP}".len())
        } else if rest.starts_with("{TSISO8601}") {
            (ctx.now.format("%Y%m%dT%H%M%SZ").to_string(), "{TSISO8601}".len())
        } else if rest.starts_with("{LOCALTIME}") {
            let local = ctx.now.with_timezone(&Local);
            (local.format("%Y%m%d_%H%M%S%z").to_string(), "{LOCALTIME}".len())
        } else if rest.starts_with("{FREQ}") {
            (ctx.frequency(1.0, ""), "{FREQ}".len())
        } else if rest.starts_with("{FREQHZ}") {
            (ctx.frequency(1.0, "Hz"), "{FREQHZ}".len())
        } else if rest.starts_with("{FREQKHZ}") {
            (ctx.frequency(1e3, "kHz"), "{FREQKHZ}".len())
        } else {
            ("{".to_string(), 1)
        };
        out.push_str(&value);
        rest = &rest[len..];
    }
    out.push_str(rest);
    out
}

/// Gains file for an output file: same name with a `.gains` extension.
pub fn gains_path(output: &Path) -> Option<PathBuf> {
    output.extension()?;
    Some(output.with_extension("gains"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(frequency_b: Option<f64>) -> FilenameContext {
        FilenameContext {
            now: Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap(),
            frequency_a: 14_074_000.0,
            frequency_b,
        }
    }

    #[test]
    fn test_default_templates() {
        assert_eq!(
            expand_template("RSP_recording_{TIMESTAMP}_{FREQKHZ}.iq", &ctx(None)),
            "RSP_recording_20250304_050607Z_14074kHz.iq"
        );
        assert_eq!(
            expand_template("RSP_recording_{TSISO8601}_{FREQHZ}.wav", &ctx(None)),
            "RSP_recording_20250304T050607Z_14074000Hz.wav"
        );
    }

    #[test]
    fn test_dual_frequencies() {
        assert_eq!(expand_template("{FREQ}", &ctx(Some(7_074_000.0))), "14074000-7074000");
        assert_eq!(expand_template("{FREQKHZ}", &ctx(Some(7_074_000.0))), "14074kHz-7074kHz");
        // Same frequency on both tuners prints once
        assert_eq!(expand_template("{FREQHZ}", &ctx(Some(14_074_000.0))), "14074000Hz");
    }

    #[test]
    fn test_unknown_placeholders_copied() {
        assert_eq!(expand_template("a{b}{FREQ", &ctx(None)), "a{b}{FREQ");
        assert_eq!(expand_template("{{FREQ}}", &ctx(None)), "{14074000}");
    }

    #[test]
    fn test_local_time_has_offset() {
        let name = expand_template("{LOCALTIME}", &ctx(None));
        assert_eq!(name.len(), "20250304_050607+0000".len());
    }

    #[test]
    fn test_gains_path() {
        assert_eq!(gains_path(Path::new("dir/rec.wav")), Some(PathBuf::from("dir/rec.gains")));
        assert_eq!(gains_path(Path::new("dir.d/rec")), None);
    }
}
