#![no_main]

use libfuzzer_sys::fuzz_target;
use metronome::classfile::ClassFile;
use metronome::config::TARGET_CLASS;
use metronome::patcher::ClassPatcher;

fuzz_target!(|data: &[u8]| {
    // Parsing and patching must reject bad input with an error, never a panic
    if let Ok(class) = ClassFile::parse(data) {
        for index in 0..class.methods.len() {
            let _ = class.method_code(index);
        }
        let _ = class.to_bytes();
    }
    let _ = ClassPatcher::default().patch(TARGET_CLASS, data);
});
