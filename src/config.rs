use serde::{Deserialize, Serialize};

/// Magic number of the 3.14 development series the opcode table targets.
pub const DEFAULT_MAGIC: u16 = 3613;

/// Settings that end up in the emitted code objects and module header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Source filename recorded in every code object.
    pub filename: String,
    /// Name of the top-level program code object.
    pub module_name: String,
    pub magic: u16,
    pub code_flags: u32,
    /// Seconds since the epoch, truncated to 32 bits in the header.
    pub source_mtime: u32,
    pub source_size: u32,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            filename: "main.py".to_string(),
            module_name: "<module>".to_string(),
            magic: DEFAULT_MAGIC,
            code_flags: 2,
            source_mtime: 0,
            source_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompileConfig::default();
        assert_eq!(config.filename, "main.py");
        assert_eq!(config.module_name, "<module>");
        assert_eq!(config.magic, 3613);
        assert_eq!(config.code_flags, 2);
    }

    #[test]
    fn test_postcard_round_trip() {
        let config = CompileConfig {
            filename: "prog.pl".to_string(),
            magic: 3600,
            ..CompileConfig::default()
        };
        let bytes = postcard::to_allocvec(&config).unwrap();
        let back: CompileConfig = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, config);
    }
}
