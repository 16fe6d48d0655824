// Copyright 2024 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Small shared utilities.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};

/// Returns the duration until the start of the next wall-clock minute.
/// The collector re-arms its tick with this after every fire, so drift
/// is corrected each minute.
pub fn until_next_minute() -> Duration {
    let now = Utc::now();
    Duration::from_secs(u64::from(60 - now.second().min(59)))
}

/// Truncates a timestamp down to the start of its minute.
pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).unwrap_or(ts)
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn until_next_minute_is_within_a_minute() {
        let wait = until_next_minute();
        assert!(wait >= Duration::from_secs(1));
        assert!(wait <= Duration::from_secs(60));
    }

    #[test]
    fn truncation_drops_seconds_and_subseconds() {
        let ts = DateTime::from_timestamp(1_700_000_123, 456_789_000).unwrap();
        let truncated = truncate_to_minute(ts);
        assert_eq!(truncated.timestamp(), 1_700_000_100);
        assert_eq!(truncated.timestamp_subsec_nanos(), 0);
        assert_eq!(truncate_to_minute(truncated), truncated);
    }
}
