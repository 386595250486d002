//! Bookkeeping for optional subscriptions.
//!
//! A device opts in to direct methods, desired-property patches, module events
//! and cloud-to-device messages one by one. The connection kernel records which
//! of them are on so it can replay them after a reconnect.

use std::fmt;

/// An optional subscription that can be enabled on an open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Direct method invocations from the cloud.
    Methods,
    /// Desired-property patches of the twin.
    TwinPatch,
    /// Module input events (routed messages on the edge).
    Events,
    /// Cloud-to-device messages.
    C2dReceive,
}

impl Feature {
    /// All features, in replay order.
    pub const ALL: [Feature; 4] = [
        Feature::Methods,
        Feature::TwinPatch,
        Feature::Events,
        Feature::C2dReceive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Methods => "methods",
            Feature::TwinPatch => "twin_patch",
            Feature::Events => "events",
            Feature::C2dReceive => "c2d_receive",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enabled/disabled state of every [`Feature`].
///
/// A flag turns on only after the transport accepted the subscription and
/// turns off only after it accepted the removal. `is_edge_module` is recorded
/// together with `events` because it changes which channel is subscribed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    methods: bool,
    twin_patch: bool,
    events: bool,
    c2d_receive: bool,
    is_edge_module: bool,
}

impl FeatureFlags {
    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::Methods => self.methods,
            Feature::TwinPatch => self.twin_patch,
            Feature::Events => self.events,
            Feature::C2dReceive => self.c2d_receive,
        }
    }

    pub fn set(&mut self, feature: Feature, enabled: bool) {
        let slot = match feature {
            Feature::Methods => &mut self.methods,
            Feature::TwinPatch => &mut self.twin_patch,
            Feature::Events => &mut self.events,
            Feature::C2dReceive => &mut self.c2d_receive,
        };
        *slot = enabled;
    }

    pub fn is_edge_module(&self) -> bool {
        self.is_edge_module
    }

    pub fn set_edge_module(&mut self, edge: bool) {
        self.is_edge_module = edge;
    }

    /// Features currently switched on.
    pub fn enabled(&self) -> Vec<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|f| self.is_enabled(*f))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled().is_empty()
    }
}

impl fmt::Display for FeatureFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.enabled().iter().map(Feature::as_str).collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_nothing_enabled() {
        let flags = FeatureFlags::default();
        assert!(flags.is_empty());
        assert!(!flags.is_edge_module());
        assert_eq!(flags.to_string(), "none");
    }

    #[test]
    fn test_set_and_list() {
        let mut flags = FeatureFlags::default();
        flags.set(Feature::TwinPatch, true);
        flags.set(Feature::Methods, true);

        assert!(flags.is_enabled(Feature::Methods));
        assert!(flags.is_enabled(Feature::TwinPatch));
        assert!(!flags.is_enabled(Feature::C2dReceive));
        assert_eq!(flags.enabled(), vec![Feature::Methods, Feature::TwinPatch]);
        assert_eq!(flags.to_string(), "methods, twin_patch");

        flags.set(Feature::Methods, false);
        assert_eq!(flags.enabled(), vec![Feature::TwinPatch]);
    }

    #[test]
    fn test_edge_module_is_independent_of_events_flag() {
        let mut flags = FeatureFlags::default();
        flags.set_edge_module(true);
        assert!(flags.is_edge_module());
        assert!(!flags.is_enabled(Feature::Events));
    }
}
