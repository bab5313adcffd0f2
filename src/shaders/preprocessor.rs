use std::collections::HashSet;

use super::get_shader_include;
use crate::error::{HairError, HairResult};

/// Simple WGSL preprocessor that resolves `#include` directives against the
/// embedded include table. Each include is expanded once per shader.
pub struct WgslPreprocessor {
    processed: HashSet<String>,
}

impl WgslPreprocessor {
    pub fn new() -> Self {
        Self {
            processed: HashSet::new(),
        }
    }

    /// Process WGSL content, resolving all #include directives
    pub fn process_content(&mut self, content: &str, current_file: &str) -> HairResult<String> {
        let mut result = String::with_capacity(content.len());

        for line in content.lines() {
            match Self::parse_include_directive(line) {
                Some(include) => {
                    if !self.processed.insert(include.clone()) {
                        result.push_str("// Skipped repeated include: ");
                        result.push_str(&include);
                        result.push('\n');
                        continue;
                    }

                    let included = get_shader_include(&include).ok_or_else(|| HairError::Shader {
                        shader: current_file.to_string(),
                        reason: format!("could not find include file '{}'", include),
                    })?;
                    let processed = self.process_content(included, &include)?;

                    result.push_str("// Begin include: ");
                    result.push_str(&include);
                    result.push('\n');
                    result.push_str(&processed);
                    result.push_str("// End include: ");
                    result.push_str(&include);
                    result.push('\n');
                }
                None => {
                    result.push_str(line);
                    result.push('\n');
                }
            }
        }

        Ok(result)
    }

    /// Parse an #include directive from a line
    fn parse_include_directive(line: &str) -> Option<String> {
        let after_include = line.trim().strip_prefix("#include")?.trim();

        // Support both #include "file.wgsl" and #include <file.wgsl>
        if after_include.len() >= 2 && after_include.starts_with('"') && after_include.ends_with('"') {
            Some(after_include.trim_matches('"').to_string())
        } else if after_include.starts_with('<') && after_include.ends_with('>') {
            Some(after_include.trim_start_matches('<').trim_end_matches('>').to_string())
        } else {
            None
        }
    }
}

impl Default for WgslPreprocessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_include_forms() {
        assert_eq!(
            WgslPreprocessor::parse_include_directive("#include \"common.wgsl\""),
            Some("common.wgsl".to_string())
        );
        assert_eq!(
            WgslPreprocessor::parse_include_directive("  #include <common.wgsl>"),
            Some("common.wgsl".to_string())
        );
        assert_eq!(WgslPreprocessor::parse_include_directive("// #include x"), None);
    }

    #[test]
    fn repeated_includes_expand_once() {
        let source = "#include \"common.wgsl\"\n#include \"common.wgsl\"\n";
        let out = WgslPreprocessor::new().process_content(source, "test").unwrap();
        assert_eq!(out.matches("// Begin include: common.wgsl").count(), 1);
        assert!(out.contains("Skipped repeated include"));
    }

    #[test]
    fn unknown_include_is_an_error() {
        let err = WgslPreprocessor::new()
            .process_content("#include \"missing.wgsl\"", "test")
            .unwrap_err();
        assert!(err.to_string().contains("missing.wgsl"));
    }
}
