//! Optional start/end trim window and its ffmpeg flags.

use serde::{Deserialize, Serialize};

/// Parse `HH:MM:SS`, `MM:SS` or plain seconds (fractions allowed).
pub fn parse_time(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() > 3 {
        return None;
    }

    let mut total = 0.0;
    for (i, part) in parts.iter().enumerate() {
        let value: f64 = part.trim().parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        // Only the last component may carry a fraction
        if i + 1 < parts.len() && value.fract() != 0.0 {
            return None;
        }
        total = total * 60.0 + value;
    }
    Some(total)
}

/// Seconds as ffmpeg wants them: integers without a trailing `.0`.
pub fn format_seconds(secs: f64) -> String {
    if secs.fract() == 0.0 {
        format!("{}", secs as i64)
    } else {
        let s = format!("{:.3}", secs);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimWindow {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Flags derived from a [`TrimWindow`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrimPlan {
    /// Goes before `-i`
    pub input_args: Vec<String>,
    /// Goes after `-i`
    pub output_args: Vec<String>,
    pub notices: Vec<String>,
}

impl TrimWindow {
    pub fn new(start: Option<&str>, end: Option<&str>) -> Self {
        let clean = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(String::from);
        Self {
            start: clean(start),
            end: clean(end),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Build trim flags. Unparseable or non-positive windows drop the
    /// duration flag with a notice instead of failing the job.
    pub fn plan(&self) -> TrimPlan {
        let mut plan = TrimPlan::default();

        if let Some(start) = &self.start {
            plan.input_args = vec!["-ss".to_string(), start.clone()];
        }

        match (&self.start, &self.end) {
            (Some(start), Some(end)) => match (parse_time(start), parse_time(end)) {
                (Some(s), Some(e)) if e - s > 0.0 => {
                    plan.output_args = vec!["-t".to_string(), format_seconds(e - s)];
                }
                (Some(_), Some(_)) => plan
                    .notices
                    .push(format!("Trim end {} is not after start {}; ignoring end", end, start)),
                _ => plan
                    .notices
                    .push(format!("Could not parse trim window {}-{}; ignoring end", start, end)),
            },
            (None, Some(end)) => {
                plan.output_args = vec!["-to".to_string(), end.clone()];
            }
            _ => {}
        }
        plan
    }

    /// Seconds of source that will actually be encoded.
    pub fn effective_duration(&self, source_s: f64) -> f64 {
        let start = self.start.as_deref().and_then(parse_time).unwrap_or(0.0);
        let end = self
            .end
            .as_deref()
            .and_then(parse_time)
            .filter(|e| *e > start)
            .unwrap_or(source_s)
            .min(source_s);
        (end - start).max(0.0)
    }
}
