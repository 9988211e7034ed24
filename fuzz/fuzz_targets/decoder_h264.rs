#![no_main]

use h264_syntax::Decoder;
use h264_syntax::DecoderConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for strip_emulation_prevention in [false, true] {
        let config = DecoderConfig {
            strip_emulation_prevention,
            ..Default::default()
        };
        let mut decoder = match Decoder::new(config) {
            Ok(decoder) => decoder,
            Err(_) => return,
        };

        // A failed call must leave the decoder usable for the next one.
        for _ in 0..2 {
            if let Err(e) = decoder.decode(data, |_| Ok(())) {
                if !e.is_recoverable() {
                    break;
                }
            }
        }
    }
});
