//! Engine-level tests: concurrency cap, isolation, cancellation, events.
