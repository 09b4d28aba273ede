// Environment overrides for shutdown timeouts
// Lets test environments shorten real-world waits without editing the config file

use super::{
    default_graceful_timeout, default_termination_timeout, default_verification_timeout,
    ShutdownSection, MAX_TIMEOUT_SECS,
};
use tracing::{info, warn};

pub const GRACEFUL_TIMEOUT_VAR: &str = "PEAR_FLEET_GRACEFUL_TIMEOUT";
pub const TERMINATION_TIMEOUT_VAR: &str = "PEAR_FLEET_TERMINATION_TIMEOUT";
pub const VERIFICATION_TIMEOUT_VAR: &str = "PEAR_FLEET_VERIFICATION_TIMEOUT";

/// Apply overrides from the process environment
pub fn apply_env(section: &mut ShutdownSection) {
    apply(section, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary lookup. An invalid value never fails:
/// it is reported and the documented default is used instead.
pub fn apply<F>(section: &mut ShutdownSection, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let targets: [(&str, &mut f64, f64); 3] = [
        (GRACEFUL_TIMEOUT_VAR, &mut section.graceful_timeout_secs, default_graceful_timeout()),
        (TERMINATION_TIMEOUT_VAR, &mut section.termination_timeout_secs, default_termination_timeout()),
        (VERIFICATION_TIMEOUT_VAR, &mut section.verification_timeout_secs, default_verification_timeout()),
    ];

    for (var, slot, default) in targets {
        let Some(raw) = lookup(var) else {
            continue;
        };

        match parse_seconds(&raw) {
            Some(secs) => {
                info!(var = var, seconds = secs, "Timeout overridden from environment");
                *slot = secs;
            }
            None => {
                warn!(
                    var = var,
                    value = %raw,
                    default_secs = default,
                    "Invalid timeout override, using default"
                );
                *slot = default;
            }
        }
    }
}

/// Positive seconds up to `MAX_TIMEOUT_SECS`; fractions allowed
fn parse_seconds(raw: &str) -> Option<f64> {
    let secs: f64 = raw.trim().parse().ok()?;
    (secs.is_finite() && secs > 0.0 && secs <= MAX_TIMEOUT_SECS).then_some(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_valid_overrides_applied() {
        let mut section = ShutdownSection::default();
        apply(
            &mut section,
            lookup(&[(GRACEFUL_TIMEOUT_VAR, "0.5"), (TERMINATION_TIMEOUT_VAR, "2")]),
        );

        assert_eq!(section.graceful_timeout_secs, 0.5);
        assert_eq!(section.termination_timeout_secs, 2.0);
        assert_eq!(section.verification_timeout_secs, default_verification_timeout());
    }

    #[test]
    fn test_invalid_override_falls_back_to_default() {
        let mut section = ShutdownSection::default();
        section.termination_timeout_secs = 12.0;

        apply(
            &mut section,
            lookup(&[
                (TERMINATION_TIMEOUT_VAR, "soon"),
                (GRACEFUL_TIMEOUT_VAR, "-3"),
                (VERIFICATION_TIMEOUT_VAR, "inf"),
            ]),
        );

        assert_eq!(section.termination_timeout_secs, default_termination_timeout());
        assert_eq!(section.graceful_timeout_secs, default_graceful_timeout());
        assert_eq!(section.verification_timeout_secs, default_verification_timeout());
    }

    #[test]
    fn test_oversized_override_falls_back_to_default() {
        let mut section = ShutdownSection::default();
        apply(
            &mut section,
            lookup(&[(GRACEFUL_TIMEOUT_VAR, "1e20"), (TERMINATION_TIMEOUT_VAR, "86401")]),
        );

        assert_eq!(section.graceful_timeout_secs, default_graceful_timeout());
        assert_eq!(section.termination_timeout_secs, default_termination_timeout());
        assert!(section.timeouts().graceful <= std::time::Duration::from_secs_f64(MAX_TIMEOUT_SECS));
    }

    #[test]
    fn test_absent_variables_leave_file_values() {
        let mut section = ShutdownSection::default();
        section.graceful_timeout_secs = 1.25;
        apply(&mut section, lookup(&[]));
        assert_eq!(section.graceful_timeout_secs, 1.25);
    }
}
