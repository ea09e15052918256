//! Fuzz harness for jobs-document deserialization.
//!
//! Exercises the parser with arbitrary byte sequences, ensuring no
//! panics on malformed JSON, non-UTF-8 payloads, oversized documents,
//! or structurally invalid job records, and that every document the
//! parser accepts passes its own structural checks.

#![no_main]
use drover_core::jobs::record::deserialize_jobs_document;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(document) = deserialize_jobs_document(data) {
        // Anything the parser accepts must survive revalidation.
        document
            .validate_structure()
            .expect("accepted document failed revalidation");
    }
});
