//! Execution context handed to child-side work

use std::collections::BTreeMap;

/// How child-side work should emit its output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Write straight to stdout/stderr (which are plain pipes or the
    /// terminal, as rebound by the spawner)
    Direct,
    /// Route output through the scheduler's logging
    SchedulerMediated,
}

/// Explicit execution context passed to a callback.
///
/// The child never gets a reference to the scheduler that spawned it; this
/// value is all it knows about its surroundings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub mode: OutputMode,
    pub color: bool,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::scheduler_mediated(true)
    }
}

impl ExecutionContext {
    pub fn direct(color: bool) -> Self {
        Self {
            mode: OutputMode::Direct,
            color,
        }
    }

    pub fn scheduler_mediated(color: bool) -> Self {
        Self {
            mode: OutputMode::SchedulerMediated,
            color,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.mode == OutputMode::Direct
    }

    /// Color is on unless `NOCOLOR` is `yes` or `true`
    pub fn color_from_settings(settings: &BTreeMap<String, String>) -> bool {
        !matches!(
            settings.get("NOCOLOR").map(String::as_str),
            Some("yes") | Some("true")
        )
    }

    /// Make terminal styling follow this context. Child-side only: the
    /// setting is process-global.
    pub(crate) fn apply(&self) {
        console::set_colors_enabled(self.color);
        console::set_colors_enabled_stderr(self.color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(value: Option<&str>) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Some(v) = value {
            map.insert("NOCOLOR".to_string(), v.to_string());
        }
        map
    }

    #[test]
    fn color_enabled_without_nocolor() {
        assert!(ExecutionContext::color_from_settings(&settings(None)));
    }

    #[test]
    fn nocolor_yes_or_true_disables_color() {
        assert!(!ExecutionContext::color_from_settings(&settings(Some("yes"))));
        assert!(!ExecutionContext::color_from_settings(&settings(Some("true"))));
    }

    #[test]
    fn other_nocolor_values_keep_color() {
        assert!(ExecutionContext::color_from_settings(&settings(Some("no"))));
        assert!(ExecutionContext::color_from_settings(&settings(Some("TRUE"))));
        assert!(ExecutionContext::color_from_settings(&settings(Some(""))));
    }

    #[test]
    fn constructors_set_mode() {
        assert!(ExecutionContext::direct(false).is_direct());
        assert!(!ExecutionContext::scheduler_mediated(true).is_direct());
        assert_eq!(ExecutionContext::default().mode, OutputMode::SchedulerMediated);
    }
}
