//! Fuzz target: selector flag splitting and parsing.
//!
//! Arbitrary NUL-separated argument lists must split without losing
//! arguments and parse to a value or an error, never a panic.

#![no_main]

use cvd::selector::split_selector_args;
use cvd::SelectorOptions;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let args: Vec<String> = text.split('\0').map(str::to_owned).collect();

    let (selectors, rest) = split_selector_args(&args);
    assert_eq!(selectors.len() + rest.len(), args.len());

    if let Ok(options) = SelectorOptions::parse(&selectors) {
        // Rendering back must parse to the same options.
        let reparsed = SelectorOptions::parse(&options.to_args()).expect("rendered selectors parse");
        assert_eq!(reparsed, options);
    }
});
