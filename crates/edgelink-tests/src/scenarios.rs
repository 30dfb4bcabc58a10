//! End-to-end session scenarios over the in-memory platform.
