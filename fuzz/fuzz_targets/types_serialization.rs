#![no_main]

use libfuzzer_sys::fuzz_target;
use specq_types::{LogEvent, VoteResult, WorkItem};

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(item) = serde_json::from_str::<WorkItem>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&item) {
            if let Ok(parsed) = serde_json::from_str::<WorkItem>(&roundtripped) {
                assert_eq!(item.id, parsed.id);
                assert_eq!(item.deps, parsed.deps);
                assert_eq!(item.status, parsed.status);
            }
        }
    }

    if let Ok(vote) = serde_json::from_str::<VoteResult>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&vote) {
            if let Ok(parsed) = serde_json::from_str::<VoteResult>(&roundtripped) {
                assert_eq!(vote.voter, parsed.voter);
                assert_eq!(vote.verdict, parsed.verdict);
            }
        }
    }

    if let Ok(event) = serde_json::from_str::<LogEvent>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&event) {
            if let Ok(parsed) = serde_json::from_str::<LogEvent>(&roundtripped) {
                assert_eq!(event.change_id, parsed.change_id);
                assert_eq!(event.event, parsed.event);
            }
        }
    }
});
