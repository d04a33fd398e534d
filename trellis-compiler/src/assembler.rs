//! Final program text: the prelude, then markup as `echo` statements and
//! generated code verbatim, in document order.

use trellis_runtime::prelude::is_prelude_line;
use trellis_runtime::{PRELUDE, string_lit};

use crate::placeholder::Segment;

pub fn assemble(segments: &[Segment]) -> String {
    let mut out = String::from(PRELUDE);
    for segment in segments {
        match segment {
            Segment::Markup(text) if text.is_empty() => {}
            Segment::Markup(text) => {
                out.push_str("echo ");
                out.push_str(&string_lit(text));
                out.push_str(";\n");
            }
            Segment::Code(code) => {
                out.push_str(code);
                if !code.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }
    out
}

/// Concatenate assembled programs into one, keeping a single prelude.
pub fn link<S: AsRef<str>>(programs: &[S]) -> String {
    let mut out = String::from(PRELUDE);
    for program in programs {
        let mut lines = program.as_ref().lines().peekable();
        while lines.peek().is_some_and(|l| is_prelude_line(l)) {
            lines.next();
        }
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markup_becomes_echo_and_code_is_verbatim() {
        let program = assemble(&[
            Segment::Markup("<p class=\"x\">\n".into()),
            Segment::Code("print escape($name);\n".into()),
            Segment::Markup("</p>".into()),
        ]);
        assert_eq!(
            program,
            format!("{PRELUDE}echo \"<p class=\\\"x\\\">\\n\";\nprint escape($name);\necho \"</p>\";\n")
        );
    }

    #[test]
    fn link_keeps_one_prelude() {
        let a = assemble(&[Segment::Markup("a".into())]);
        let b = assemble(&[Segment::Markup("b".into())]);
        let linked = link(&[a, b]);
        assert_eq!(linked.matches("#!trellis").count(), 1);
        assert_eq!(linked, format!("{PRELUDE}echo \"a\";\necho \"b\";\n"));
    }
}
