//! `{{var}}` placeholder substitution for notification templates.

use std::collections::HashMap;

/// Substitute every `{{name}}` placeholder in `template` with its value
/// from `vars`. A placeholder with no matching variable renders as an
/// empty string and its name is appended to the returned warnings list.
pub fn render(template: &str, vars: &HashMap<String, String>) -> (String, Vec<String>) {
    let mut output = String::with_capacity(template.len());
    let mut warnings = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            // No closing brace: treat the rest of the template as literal.
            output.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after_open[..end].trim();
        match vars.get(name) {
            Some(value) => output.push_str(value),
            None => warnings.push(name.to_string()),
        }
        rest = &after_open[end + 2..];
    }
    output.push_str(rest);

    (output, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn substitutes_known_variables() {
        let (rendered, warnings) = render("job {{job_id}} failed on {{platform}}", &vars(&[
            ("job_id", "123"),
            ("platform", "linkedin"),
        ]));
        assert_eq!(rendered, "job 123 failed on linkedin");
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_variable_renders_empty_and_warns() {
        let (rendered, warnings) = render("hello {{name}}", &HashMap::new());
        assert_eq!(rendered, "hello ");
        assert_eq!(warnings, vec!["name".to_string()]);
    }

    #[test]
    fn tolerates_whitespace_inside_braces() {
        let (rendered, warnings) = render("{{ job_id }}", &vars(&[("job_id", "abc")]));
        assert_eq!(rendered, "abc");
        assert!(warnings.is_empty());
    }

    #[test]
    fn unclosed_brace_is_kept_literal() {
        let (rendered, warnings) = render("broken {{template", &HashMap::new());
        assert_eq!(rendered, "broken {{template");
        assert!(warnings.is_empty());
    }

    #[test]
    fn plain_text_passes_through_unchanged() {
        let (rendered, warnings) = render("no placeholders here", &HashMap::new());
        assert_eq!(rendered, "no placeholders here");
        assert!(warnings.is_empty());
    }
}
