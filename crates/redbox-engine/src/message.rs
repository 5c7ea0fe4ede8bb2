//! Capability responder for the driver's synchronous message queries.
//!
//! The driver may ask at any time, including before buffers exist and
//! concurrently with the audio callback, so answers come from a static table
//! and never touch session state.

/// Message selectors the driver may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Selector {
    SelectorSupported = 1,
    EngineVersion = 2,
    SupportsInputMonitor = 3,
    ResetRequest = 4,
    BufferSizeChange = 5,
    ResyncRequest = 6,
    LatenciesChanged = 7,
    SupportsTimeInfo = 8,
    SupportsTimeCode = 9,
}

impl Selector {
    pub const ALL: [Selector; 9] = [
        Selector::SelectorSupported,
        Selector::EngineVersion,
        Selector::SupportsInputMonitor,
        Selector::ResetRequest,
        Selector::BufferSizeChange,
        Selector::ResyncRequest,
        Selector::LatenciesChanged,
        Selector::SupportsTimeInfo,
        Selector::SupportsTimeCode,
    ];

    pub fn from_raw(raw: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| *s as i64 == raw)
    }
}

/// Host engine version reported to the driver.
pub const ENGINE_VERSION: i64 = 2;

/// Fixed answer for every selector.
pub static MESSAGE_TABLE: [(Selector, i64); 9] = [
    (Selector::SelectorSupported, 0),
    (Selector::EngineVersion, ENGINE_VERSION),
    (Selector::SupportsInputMonitor, 0),
    (Selector::ResetRequest, 1),
    (Selector::BufferSizeChange, 1),
    (Selector::ResyncRequest, 1),
    (Selector::LatenciesChanged, 1),
    (Selector::SupportsTimeInfo, 1),
    (Selector::SupportsTimeCode, 0),
];

/// Answer a driver message. Unknown selectors answer 0.
#[inline]
pub fn respond(selector: i64, _value: i64) -> i64 {
    MESSAGE_TABLE
        .iter()
        .find(|(s, _)| *s as i64 == selector)
        .map(|(_, response)| *response)
        .unwrap_or(0)
}

/// Check that every selector has exactly one table entry.
pub fn validate_table() -> Result<(), Selector> {
    for selector in Selector::ALL {
        let entries = MESSAGE_TABLE.iter().filter(|(s, _)| *s == selector).count();
        if entries != 1 {
            return Err(selector);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_complete() {
        assert_eq!(validate_table(), Ok(()));
    }

    #[test]
    fn responds_from_table() {
        assert_eq!(respond(Selector::EngineVersion as i64, 0), 2);
        assert_eq!(respond(Selector::SupportsTimeInfo as i64, 0), 1);
        assert_eq!(respond(Selector::SupportsTimeCode as i64, 0), 0);
        assert_eq!(respond(Selector::ResetRequest as i64, 0), 1);
        assert_eq!(respond(Selector::SupportsInputMonitor as i64, 0), 0);
    }

    #[test]
    fn unknown_selectors_answer_zero() {
        assert_eq!(respond(0, 0), 0);
        assert_eq!(respond(42, 7), 0);
        assert_eq!(respond(-1, 0), 0);
    }

    #[test]
    fn from_raw_round_trips() {
        for selector in Selector::ALL {
            assert_eq!(Selector::from_raw(selector as i64), Some(selector));
        }
        assert_eq!(Selector::from_raw(10), None);
    }
}
