//! The fixed prelude every compiled program starts with.

/// Bumped whenever the statement language or a core helper changes meaning.
pub const RUNTIME_VERSION: u32 = 1;

/// Core helpers generated code may call without a namespace.
pub const CORE_HELPERS: &[&str] = &["lookup", "escape", "attr", "concat", "truthy", "classes"];

pub const PRELUDE: &str = "#!trellis 1\nuse lookup, escape, attr, concat, truthy, classes;\n";

/// True when `line` is one of the prelude's own lines.
pub fn is_prelude_line(line: &str) -> bool {
    let line = line.trim();
    line.starts_with("#!trellis ") || (line.starts_with("use ") && line.ends_with(';'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_agrees_with_constants() {
        let mut lines = PRELUDE.lines();
        assert_eq!(lines.next(), Some(format!("#!trellis {RUNTIME_VERSION}").as_str()));
        let imports = lines.next().unwrap();
        let names: Vec<&str> = imports
            .trim_start_matches("use ")
            .trim_end_matches(';')
            .split(", ")
            .collect();
        assert_eq!(names, CORE_HELPERS);
        assert!(lines.next().is_none());
    }
}
