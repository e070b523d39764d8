//! Human-readable diagnostics.
//!
//! Everything here goes to stderr and is gated by configuration flags;
//! stdout belongs to the traced process.

use heaptrace_inspector::{ClassRef, Inspector};

/// Convert a type signature to a readable class name.
///
/// `Ljava/util/List;` becomes `java.util.List`, `[[I` becomes `int[][]`,
/// `Z` becomes `boolean`. An unknown primitive letter renders as an empty
/// name.
pub fn render_class_name(signature: &str) -> String {
    let nesting = signature.bytes().take_while(|&b| b == b'[').count();
    let base = &signature[nesting..];

    let mut name = if let Some(rest) = base.strip_prefix('L') {
        rest.trim_end_matches(';').replace('/', ".")
    } else {
        let keyword = match base.as_bytes().first() {
            Some(b'B') => "byte",
            Some(b'C') => "char",
            Some(b'D') => "double",
            Some(b'F') => "float",
            Some(b'I') => "int",
            Some(b'J') => "long",
            Some(b'S') => "short",
            Some(b'Z') => "boolean",
            _ => return String::new(),
        };
        keyword.to_string()
    };

    for _ in 0..nesting {
        name.push_str("[]");
    }
    name
}

/// Best-effort readable name of a class handle; empty when the handle is
/// stale or absent.
pub fn class_name(inspector: &dyn Inspector, cls: Option<ClassRef>) -> String {
    match cls {
        Some(cls) => inspector
            .class_signature(cls)
            .map(|signature| render_class_name(&signature))
            .unwrap_or_default(),
        None => String::new(),
    }
}

/// One line per attributed field write.
pub fn log_field_write(cause: &str, receiver: &str, value: &str) {
    eprintln!("{cause}: {receiver}.field = {value}");
}

/// One line per attributed array element write.
pub fn log_array_write(cause: &str, array: &str, index: usize, value: &str) {
    // The element class reads better than the array class here.
    let element = array.strip_suffix("[]").unwrap_or(array);
    eprintln!("{cause}: {element}[{index}] = {value}");
}

/// One line per initializer entry.
pub fn log_initializer_entry(outer: &str, inner: &str) {
    eprintln!("{outer}: {inner}.<clinit>()");
}

/// One line per initializer exit.
pub fn log_initializer_exit(inner: &str) {
    eprintln!("{inner}.<clinit>() ENDED");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_signature() {
        assert_eq!(render_class_name("Ljava/util/List;"), "java.util.List");
        assert_eq!(render_class_name("Lcom/example/A;"), "com.example.A");
    }

    #[test]
    fn test_primitive_signatures() {
        assert_eq!(render_class_name("B"), "byte");
        assert_eq!(render_class_name("C"), "char");
        assert_eq!(render_class_name("D"), "double");
        assert_eq!(render_class_name("F"), "float");
        assert_eq!(render_class_name("I"), "int");
        assert_eq!(render_class_name("J"), "long");
        assert_eq!(render_class_name("S"), "short");
        assert_eq!(render_class_name("Z"), "boolean");
    }

    #[test]
    fn test_array_signatures() {
        assert_eq!(render_class_name("[I"), "int[]");
        assert_eq!(render_class_name("[[I"), "int[][]");
        assert_eq!(
            render_class_name("[Ljava/lang/String;"),
            "java.lang.String[]"
        );
    }

    #[test]
    fn test_unknown_primitive_renders_empty() {
        assert_eq!(render_class_name("Q"), "");
        assert_eq!(render_class_name("[Q"), "");
        assert_eq!(render_class_name(""), "");
    }
}
