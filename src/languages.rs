//! Language configuration for compilation and execution

use std::collections::HashMap;
use std::fmt;

use anyhow::Context;
use serde::Deserialize;

/// Supported languages. The numeric id is what submissions carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    C,
    Cpp,
    Java,
    Python,
    Bash,
    CSharp,
    JavaScript,
    Kotlin,
    Go,
}

impl Language {
    pub const ALL: [Language; 9] = [
        Language::C,
        Language::Cpp,
        Language::Java,
        Language::Python,
        Language::Bash,
        Language::CSharp,
        Language::JavaScript,
        Language::Kotlin,
        Language::Go,
    ];

    /// Resolve a raw language id. Unknown ids yield None.
    pub fn from_id(id: i32) -> Option<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    /// Resolve a `languages.toml` key.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|lang| lang.name() == name)
    }

    pub fn id(&self) -> i32 {
        *self as i32
    }

    /// Key used in `languages.toml`
    pub fn name(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Python => "python",
            Language::Bash => "bash",
            Language::CSharp => "c_sharp",
            Language::JavaScript => "java_script",
            Language::Kotlin => "kotlin",
            Language::Go => "go",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    pub language: Language,
    /// Name of the source file (e.g., "Solution.cpp")
    pub source_file: String,
    /// Build command (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Sandbox run token, `@` separated
    pub run_command: String,
    /// Build image override; the configured runner image is used otherwise
    pub image: Option<String>,
}

impl LanguageConfig {
    pub fn is_interpreted(&self) -> bool {
        self.compile_command.is_none()
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    image: Option<String>,
}

/// Language definitions keyed by language
#[derive(Debug, Clone)]
pub struct LanguageTable {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageTable {
    /// Definitions compiled into the binary
    pub fn builtin() -> anyhow::Result<Self> {
        Self::parse(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/files/languages.toml"
        )))
    }

    /// Parse a TOML table of language definitions.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> =
            toml::from_str(content).context("Invalid language table")?;

        let mut configs = HashMap::new();
        for (name, raw) in raw_configs {
            let language = Language::from_name(&name.to_lowercase())
                .with_context(|| format!("Unknown language in table: {}", name))?;
            if raw.run_command.chars().any(char::is_whitespace) {
                anyhow::bail!(
                    "Run command for {} must be a single token: {:?}",
                    language,
                    raw.run_command
                );
            }

            let config = LanguageConfig {
                language,
                source_file: raw.source_file,
                compile_command: raw.compile_command.map(|cmd| into_command(&cmd)),
                run_command: raw.run_command,
                image: raw.image,
            };
            configs.insert(language, config);
        }

        Ok(Self { configs })
    }

    /// Get configuration by raw language id
    pub fn get(&self, language_id: i32) -> Option<&LanguageConfig> {
        Language::from_id(language_id).and_then(|lang| self.configs.get(&lang))
    }

    /// Get all configured language names
    pub fn supported(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.configs.keys().map(|l| l.name()).collect();
        names.sort_unstable();
        names
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_id() {
        assert_eq!(Language::from_id(0), Some(Language::C));
        assert_eq!(Language::from_id(3), Some(Language::Python));
        assert_eq!(Language::from_id(8), Some(Language::Go));
        assert_eq!(Language::from_id(9), None);
        assert_eq!(Language::from_id(-1), None);
        for lang in Language::ALL {
            assert_eq!(Language::from_id(lang.id()), Some(lang));
            assert_eq!(Language::from_name(lang.name()), Some(lang));
        }
    }

    #[test]
    fn test_builtin_table() {
        let table = LanguageTable::builtin().unwrap();
        assert_eq!(table.supported().len(), Language::ALL.len());

        let python = table.get(Language::Python.id()).unwrap();
        assert!(python.is_interpreted());
        assert_eq!(python.run_command, "python3@Solution.py");

        let java = table.get(Language::Java.id()).unwrap();
        assert_eq!(java.source_file, "Solution.java");
        assert_eq!(
            java.compile_command.as_deref(),
            Some(&["javac", "-encoding", "UTF-8", "Solution.java"].map(String::from)[..])
        );
    }

    #[test]
    fn test_parse_partial_table() {
        let table = LanguageTable::parse(
            r#"
[c]
source_file = "Solution.c"
compile_command = "gcc Solution.c -o Solution"
run_command = "./Solution"
"#,
        )
        .unwrap();

        assert!(table.get(Language::C.id()).is_some());
        assert!(table.get(Language::Python.id()).is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_language() {
        let result = LanguageTable::parse(
            r#"
[cobol]
source_file = "Solution.cob"
run_command = "./Solution"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_rejects_spaced_run_command() {
        let result = LanguageTable::parse(
            r#"
[python]
source_file = "Solution.py"
run_command = "python3 Solution.py"
"#,
        );
        assert!(result.is_err());
    }
}
