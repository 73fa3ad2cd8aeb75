//! Text templater shared by every SQL string in the adapter.
//!
//! Substitutions: `%p` → table-name prefix, `%t` → table tablespace,
//! `%i` → index tablespace, `%m` → `UNLOGGED` when requested. A `{...}`
//! segment survives only if at least one substitution inside it produced
//! output, which is how optional `TABLESPACE` clauses appear and vanish:
//!
//! ```text
//! "CREATE %m TABLE %p_nodes (...) {TABLESPACE %t}"
//! ```
//!
//! Unmatched `%` characters pass through verbatim, so `%` retains its SQL
//! meaning elsewhere.

/// Substitution values for [`expand`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TemplateVars<'a> {
    pub prefix: &'a str,
    pub tablespace_data: Option<&'a str>,
    pub tablespace_index: Option<&'a str>,
    pub unlogged: bool,
}

/// Expands a SQL template against the given substitutions.
pub(crate) fn expand(template: &str, vars: &TemplateVars<'_>) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    // Start of the innermost open `{` segment in `out`, and whether any
    // substitution inside it produced output.
    let mut open_brace: Option<usize> = None;
    let mut copied = false;

    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                open_brace = Some(out.len());
                copied = false;
            }
            '}' => {
                if let Some(start) = open_brace {
                    if !copied {
                        out.truncate(start);
                    }
                }
            }
            '%' => match chars.peek() {
                Some('p') => {
                    chars.next();
                    if !vars.prefix.is_empty() {
                        out.push_str(vars.prefix);
                        copied = true;
                    }
                }
                Some('t') => {
                    chars.next();
                    if let Some(ts) = vars.tablespace_data {
                        out.push_str(ts);
                        copied = true;
                    }
                }
                Some('i') => {
                    chars.next();
                    if let Some(ts) = vars.tablespace_index {
                        out.push_str(ts);
                        copied = true;
                    }
                }
                Some('m') => {
                    chars.next();
                    if vars.unlogged {
                        out.push_str("UNLOGGED");
                        copied = true;
                    }
                }
                _ => out.push('%'),
            },
            other => out.push(other),
        }
    }
    out
}
