use std::fmt::Write;

use crate::types::{Node, attribute_value};

/// Indented one-line-per-node outline of a materialized tree, at most `cap`
/// lines. Whitespace-only text is skipped and long text is previewed.
pub fn outline(root: &Node, cap: usize) -> Vec<String> {
    struct IndentGuard<'a> {
        indent: &'a mut String,
        step: usize,
    }

    impl Drop for IndentGuard<'_> {
        fn drop(&mut self) {
            let new_len = self.indent.len() - self.step;
            self.indent.truncate(new_len);
        }
    }

    fn trimmed_nonempty_slice(s: &str) -> Option<&str> {
        let trimmed = s.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    fn push_preview_replace_newlines(out: &mut String, s: &str, max_chars: usize) {
        let mut truncated = false;
        for (i, ch) in s.chars().enumerate() {
            if i == max_chars {
                truncated = true;
                break;
            }
            out.push(if ch == '\n' { ' ' } else { ch });
        }
        if truncated {
            out.push('…');
        }
    }

    const INDENT_STEP: &str = "  ";
    const PREVIEW_CHARS: usize = 40;

    fn walk_children(children: &[Node], indent: &mut String, out: &mut Vec<String>, left: &mut usize) {
        indent.push_str(INDENT_STEP);
        let mut guard = IndentGuard {
            indent,
            step: INDENT_STEP.len(),
        };
        for c in children {
            walk(c, &mut *guard.indent, out, left);
        }
    }

    fn walk(node: &Node, indent: &mut String, out: &mut Vec<String>, left: &mut usize) {
        if *left == 0 {
            return;
        }
        *left -= 1;
        let mut line = String::with_capacity(indent.len() + 64);
        line.push_str(indent);
        match node {
            Node::Document {
                doctype,
                mode,
                children,
                ..
            } => {
                match doctype {
                    Some(dt) => {
                        line.push_str("<!DOCTYPE ");
                        line.push_str(&dt.name);
                        line.push('>');
                    }
                    None => line.push_str("#document"),
                }
                if let Some(mode) = mode {
                    let _ = write!(line, "  ({mode:?})");
                }
                out.push(line);
                walk_children(children, indent, out, left);
            }
            Node::Fragment { children, .. } => {
                line.push_str("#fragment");
                out.push(line);
                walk_children(children, indent, out, left);
            }
            Node::Element {
                name,
                attributes,
                form_owner,
                template_contents,
                shadow_root,
                children,
                ..
            } => {
                line.push('<');
                line.push_str(name);
                for key in ["id", "class"] {
                    if let Some(value) = attribute_value(attributes, key).filter(|v| !v.is_empty()) {
                        let _ = write!(line, r#" {key}="{value}""#);
                    }
                }
                line.push('>');
                if let Some(form) = form_owner {
                    let _ = write!(line, "  [form {}]", form.0);
                }
                out.push(line);
                if let Some(root) = shadow_root {
                    walk_labelled("#shadow-root", root, indent, out, left);
                }
                if let Some(contents) = template_contents {
                    walk_labelled("#template-contents", contents, indent, out, left);
                }
                walk_children(children, indent, out, left);
            }
            Node::Text { text, .. } => {
                let Some(trimmed) = trimmed_nonempty_slice(text) else {
                    *left += 1;
                    return;
                };
                line.push('"');
                push_preview_replace_newlines(&mut line, trimmed, PREVIEW_CHARS);
                line.push('"');
                out.push(line);
            }
            Node::Comment { text, .. } => {
                line.push_str("<!-- ");
                push_preview_replace_newlines(&mut line, text, PREVIEW_CHARS);
                line.push_str(" -->");
                out.push(line);
            }
        }
    }

    fn walk_labelled(
        label: &str,
        fragment: &Node,
        indent: &mut String,
        out: &mut Vec<String>,
        left: &mut usize,
    ) {
        if *left == 0 {
            return;
        }
        *left -= 1;
        indent.push_str(INDENT_STEP);
        let mut guard = IndentGuard {
            indent,
            step: INDENT_STEP.len(),
        };
        out.push(format!("{}{label}", guard.indent));
        walk_children(fragment.children(), &mut *guard.indent, out, left);
    }

    let mut out = Vec::new();
    let mut left = cap;
    let mut indent = String::new();
    walk(root, &mut indent, &mut out, &mut left);
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::{Attribute, Id};

    #[test]
    fn outline_shows_structure_and_skips_blank_text() {
        let tree = Node::Document {
            id: Id(1),
            doctype: None,
            mode: None,
            children: vec![Node::Element {
                id: Id(2),
                name: Arc::from("div"),
                attributes: vec![Attribute::new("id", "x")],
                form_owner: None,
                template_contents: None,
                shadow_root: Some(Box::new(Node::Fragment {
                    id: Id(4),
                    children: vec![Node::Text {
                        id: Id(5),
                        text: "shadow".to_string(),
                    }],
                })),
                children: vec![Node::Text {
                    id: Id(3),
                    text: "  \n ".to_string(),
                }],
            }],
        };
        assert_eq!(
            outline(&tree, 10),
            vec![
                "#document".to_string(),
                r#"  <div id="x">"#.to_string(),
                "    #shadow-root".to_string(),
                r#"      "shadow""#.to_string(),
            ]
        );
        assert_eq!(outline(&tree, 1).len(), 1);
    }
}
