#![no_main]

use libfuzzer_sys::fuzz_target;

// The file-list reader must reject arbitrary garbage without panicking, and
// anything it accepts must serialize back into a parseable document.
fuzz_target!(|data: &[u8]| {
    if let Ok(tree) = rust_dc::fl::xml::parse_filelist(data) {
        let doc = rust_dc::fl::xml::serialize_filelist(&tree, "fuzz");
        rust_dc::fl::xml::parse_filelist(doc.as_bytes()).expect("reserialized list must parse");
    }
});
