pub const HEADER: &[u8] = b"(function(exports,require,module,__filename,__dirname){";
pub const FOOTER: &[u8] = b"\n})";

const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

pub fn strip_bom(source: &[u8]) -> &[u8] {
    source.strip_prefix(BOM).unwrap_or(source)
}

/// Wraps module source in the CommonJS function prelude. A leading shebang is turned into a line comment.
pub fn wrap(source: &[u8]) -> Vec<u8> {
    let mut body = strip_bom(source);
    if let Some((&0, rest)) = body.split_last() {
        body = rest;
    }
    let mut wrapped = Vec::with_capacity(HEADER.len() + body.len() + FOOTER.len());
    wrapped.extend_from_slice(HEADER);
    let start = wrapped.len();
    wrapped.extend_from_slice(body);
    if body.starts_with(b"#!") {
        wrapped[start] = b'/';
        wrapped[start + 1] = b'/';
    }
    wrapped.extend_from_slice(FOOTER);
    wrapped
}

pub fn is_json(id: &str) -> bool {
    id.ends_with(".json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_source_in_function_prelude() {
        let wrapped = wrap(b"module.exports = 1;");
        assert_eq!(
            String::from_utf8(wrapped).expect("utf8"),
            "(function(exports,require,module,__filename,__dirname){module.exports = 1;\n})"
        );
    }

    #[test]
    fn strips_bom_and_comments_out_shebang() {
        let mut source = BOM.to_vec();
        source.extend_from_slice(b"#!/usr/bin/env node\nexports.x = 2;\0");
        let wrapped = String::from_utf8(wrap(&source)).expect("utf8");
        assert!(wrapped.starts_with("(function(exports,require,module,__filename,__dirname){///usr/bin/env node\n"));
        assert!(wrapped.ends_with("exports.x = 2;\n})"));
    }
}
