use std::collections::BTreeSet;

use crate::types::{RecordId, TimestampMs};

/// Records ordered by sale time, record id breaking ties.
pub type TimeIndex = BTreeSet<(TimestampMs, RecordId)>;
