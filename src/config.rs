use crate::error::DocshardError;
use bson::RawBsonRef;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// Runtime configuration for a [`QueryCoalescer`](crate::coalescer::QueryCoalescer)
/// instance, fixed at construction.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Per-wait-slice timeout after which a follower may attempt promotion.
    pub max_wait: Duration,
    /// Total budget before a follower gives up with a deadline error.
    pub max_total_wait: Duration,
    /// Groups at this size push new callers onto the independent path.
    pub max_waiters_per_group: usize,
    /// Callers whose version would widen the group past this run independently.
    pub max_version_gap: u64,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(100),
            max_total_wait: Duration::from_secs(10),
            max_waiters_per_group: 1000,
            max_version_gap: 500,
        }
    }
}

impl CoalescerConfig {
    /// Low-latency profile: short wait slices, tight total budget.
    pub fn low_latency() -> Self {
        Self {
            max_wait: Duration::from_millis(20),
            max_total_wait: Duration::from_secs(2),
            ..Self::default()
        }
    }
}

// Server-parameter names. Startup- and runtime-settable.
pub const COALESCER_ENABLED: &str = "configQueryCoalescerEnabled";
pub const COALESCER_WINDOW_MS: &str = "configQueryCoalescerWindowMS";
pub const COALESCER_MAX_WAIT_MS: &str = "configQueryCoalescerMaxWaitMS";
pub const COALESCER_MAX_WAITERS: &str = "configQueryCoalescerMaxWaiters";
pub const COALESCER_MAX_VERSION_GAP: &str = "configQueryCoalescerMaxVersionGap";

/// Runtime-settable coalescer parameters.
///
/// Reads go through relaxed atomics; writes validate type and range before
/// committing, so a rejected update leaves the prior value intact. Subscribers
/// take a [`CoalescerSettings::snapshot`] rather than reading fields piecemeal.
pub struct CoalescerSettings {
    enabled: AtomicBool,
    window_ms: AtomicI64,
    max_wait_ms: AtomicI64,
    max_waiters: AtomicI64,
    max_version_gap: AtomicI64,
}

impl Default for CoalescerSettings {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            window_ms: AtomicI64::new(5),
            max_wait_ms: AtomicI64::new(100),
            max_waiters: AtomicI64::new(1000),
            max_version_gap: AtomicI64::new(500),
        }
    }
}

impl CoalescerSettings {
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms.load(Ordering::Relaxed)
    }

    pub fn max_wait_ms(&self) -> i64 {
        self.max_wait_ms.load(Ordering::Relaxed)
    }

    pub fn max_waiters(&self) -> i64 {
        self.max_waiters.load(Ordering::Relaxed)
    }

    pub fn max_version_gap(&self) -> i64 {
        self.max_version_gap.load(Ordering::Relaxed)
    }

    /// Materialize a [`CoalescerConfig`] from the current parameter values.
    ///
    /// The total-wait budget is not runtime-settable and keeps its default.
    pub fn snapshot(&self) -> CoalescerConfig {
        CoalescerConfig {
            max_wait: Duration::from_millis(self.max_wait_ms() as u64),
            max_waiters_per_group: self.max_waiters() as usize,
            max_version_gap: self.max_version_gap() as u64,
            ..CoalescerConfig::default()
        }
    }

    /// Set a parameter from a typed BSON value, validating type and range.
    pub fn set(&self, name: &str, value: RawBsonRef<'_>) -> Result<(), DocshardError> {
        match name {
            COALESCER_ENABLED => {
                let flag = value.as_bool().ok_or_else(|| DocshardError::TypeMismatch {
                    message: format!("{COALESCER_ENABLED} must be a boolean"),
                })?;
                self.enabled.store(flag, Ordering::Relaxed);
                Ok(())
            }
            COALESCER_WINDOW_MS => {
                self.set_int(&self.window_ms, name, numeric_i64_named(value, name)?, 1, 1000)
            }
            COALESCER_MAX_WAIT_MS => {
                self.set_int(&self.max_wait_ms, name, numeric_i64_named(value, name)?, 10, 60000)
            }
            COALESCER_MAX_WAITERS => {
                self.set_int(&self.max_waiters, name, numeric_i64_named(value, name)?, 1, 100_000)
            }
            COALESCER_MAX_VERSION_GAP => self.set_int(
                &self.max_version_gap,
                name,
                numeric_i64_named(value, name)?,
                1,
                100_000,
            ),
            other => Err(DocshardError::InvalidArgument(format!(
                "unknown server parameter '{other}'"
            ))),
        }
    }

    /// Set a parameter from its string spelling (startup path).
    pub fn set_from_str(&self, name: &str, raw: &str) -> Result<(), DocshardError> {
        match name {
            COALESCER_ENABLED => {
                let flag = match raw {
                    "true" | "1" => true,
                    "false" | "0" => false,
                    _ => {
                        return Err(DocshardError::InvalidConfig {
                            message: format!("{COALESCER_ENABLED} must be 'true' or 'false'"),
                        });
                    }
                };
                self.enabled.store(flag, Ordering::Relaxed);
                Ok(())
            }
            COALESCER_WINDOW_MS
            | COALESCER_MAX_WAIT_MS
            | COALESCER_MAX_WAITERS
            | COALESCER_MAX_VERSION_GAP => {
                let parsed: i64 = raw.parse().map_err(|_| DocshardError::InvalidConfig {
                    message: format!("{name} must be a valid integer"),
                })?;
                let (slot, min, max) = self.int_slot(name);
                self.set_int(slot, name, parsed, min, max)
            }
            other => Err(DocshardError::InvalidArgument(format!(
                "unknown server parameter '{other}'"
            ))),
        }
    }

    /// Append every parameter's current value to a document (diagnostics).
    pub fn append_all(&self, out: &mut bson::RawDocumentBuf) {
        out.append(COALESCER_ENABLED, self.enabled());
        out.append(COALESCER_WINDOW_MS, self.window_ms());
        out.append(COALESCER_MAX_WAIT_MS, self.max_wait_ms());
        out.append(COALESCER_MAX_WAITERS, self.max_waiters());
        out.append(COALESCER_MAX_VERSION_GAP, self.max_version_gap());
    }

    fn int_slot(&self, name: &str) -> (&AtomicI64, i64, i64) {
        match name {
            COALESCER_WINDOW_MS => (&self.window_ms, 1, 1000),
            COALESCER_MAX_WAIT_MS => (&self.max_wait_ms, 10, 60000),
            COALESCER_MAX_WAITERS => (&self.max_waiters, 1, 100_000),
            COALESCER_MAX_VERSION_GAP => (&self.max_version_gap, 1, 100_000),
            _ => unreachable!("int_slot called for non-integer parameter"),
        }
    }

    fn set_int(
        &self,
        slot: &AtomicI64,
        name: &str,
        value: i64,
        min: i64,
        max: i64,
    ) -> Result<(), DocshardError> {
        if value < min || value > max {
            return Err(DocshardError::InvalidConfig {
                message: format!("{name} must be between {min} and {max}"),
            });
        }
        slot.store(value, Ordering::Relaxed);
        Ok(())
    }
}

fn numeric_i64_named(value: RawBsonRef<'_>, name: &str) -> Result<i64, DocshardError> {
    match value {
        RawBsonRef::Int32(v) => Ok(v as i64),
        RawBsonRef::Int64(v) => Ok(v),
        RawBsonRef::Double(d) if d.fract() == 0.0 && d.abs() < i64::MAX as f64 => Ok(d as i64),
        _ => Err(DocshardError::TypeMismatch {
            message: format!("{name} must be a number"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::rawdoc;

    fn value_of(doc: &bson::RawDocumentBuf, key: &str) -> i64 {
        match doc.get(key).unwrap().unwrap() {
            RawBsonRef::Int64(v) => v,
            other => panic!("unexpected type for {key}: {other:?}"),
        }
    }

    #[test]
    fn defaults_match_wire_documentation() {
        let settings = CoalescerSettings::default();
        assert!(!settings.enabled());
        assert_eq!(settings.window_ms(), 5);
        assert_eq!(settings.max_wait_ms(), 100);
        assert_eq!(settings.max_waiters(), 1000);
        assert_eq!(settings.max_version_gap(), 500);
    }

    #[test]
    fn typed_setter_validates_type_and_range() {
        let settings = CoalescerSettings::default();
        let doc = rawdoc! { "bad": "nope", "low": 0, "ok": 250 };

        let bad = doc.get("bad").unwrap().unwrap();
        let err = settings.set(COALESCER_MAX_WAIT_MS, bad).unwrap_err();
        assert_eq!(err.code_str(), "type_mismatch");
        assert_eq!(settings.max_wait_ms(), 100);

        let low = doc.get("low").unwrap().unwrap();
        let err = settings.set(COALESCER_MAX_WAIT_MS, low).unwrap_err();
        assert_eq!(err.code_str(), "invalid_config");
        assert_eq!(settings.max_wait_ms(), 100);

        let ok = doc.get("ok").unwrap().unwrap();
        settings.set(COALESCER_MAX_WAIT_MS, ok).unwrap();
        assert_eq!(settings.max_wait_ms(), 250);
    }

    #[test]
    fn string_setter_parses_and_bounds() {
        let settings = CoalescerSettings::default();
        settings.set_from_str(COALESCER_ENABLED, "true").unwrap();
        assert!(settings.enabled());
        settings
            .set_from_str(COALESCER_MAX_VERSION_GAP, "750")
            .unwrap();
        assert_eq!(settings.max_version_gap(), 750);

        assert!(settings.set_from_str(COALESCER_ENABLED, "yes").is_err());
        assert!(settings
            .set_from_str(COALESCER_MAX_VERSION_GAP, "100001")
            .is_err());
        assert_eq!(settings.max_version_gap(), 750);
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let settings = CoalescerSettings::default();
        let err = settings
            .set_from_str("configQueryCoalescerBogus", "1")
            .unwrap_err();
        assert_eq!(err.code_str(), "invalid_argument");
    }

    #[test]
    fn snapshot_reflects_current_values() {
        let settings = CoalescerSettings::default();
        settings.set_from_str(COALESCER_MAX_WAIT_MS, "40").unwrap();
        settings.set_from_str(COALESCER_MAX_WAITERS, "8").unwrap();
        let config = settings.snapshot();
        assert_eq!(config.max_wait, Duration::from_millis(40));
        assert_eq!(config.max_waiters_per_group, 8);
        assert_eq!(config.max_version_gap, 500);
    }

    #[test]
    fn append_all_reports_every_parameter() {
        let settings = CoalescerSettings::default();
        let mut doc = bson::RawDocumentBuf::new();
        settings.append_all(&mut doc);
        assert_eq!(value_of(&doc, COALESCER_WINDOW_MS), 5);
        assert_eq!(value_of(&doc, COALESCER_MAX_WAITERS), 1000);
    }
}
