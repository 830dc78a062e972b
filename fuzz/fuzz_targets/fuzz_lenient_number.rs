#![no_main]

use cw_types::Scalar;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Lenient coercion is total: any text yields a finite number.
        let value = Scalar::from(input).lenient_number();
        assert!(value.is_finite());
        // Strict coercion may fail but must never panic.
        let _ = Scalar::from(input).strict_number();
    }
});
