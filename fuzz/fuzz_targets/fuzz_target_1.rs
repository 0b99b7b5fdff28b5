#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_engine::AnalysisEngine;
use packet_engine::decode::decode;

fuzz_target!(|data: &[u8]| {
    decode(data, 1);
    AnalysisEngine::default().analyze(data, 1);
});
