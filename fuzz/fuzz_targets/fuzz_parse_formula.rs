#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Arbitrary input must never panic the parser; a parsed formula
        // must reparse to the same AST and variable set.
        if let Ok(formula) = cw_formula::parse(input) {
            let again = cw_formula::parse(formula.expression()).expect("reparse");
            assert_eq!(formula.ast(), again.ast());
            assert_eq!(formula.variables(), again.variables());
        }
    }
});
