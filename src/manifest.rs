// Dependency manifest parsing: feeds version, framework and base-context signals.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    Rust,
    Node,
    Python,
    Generic,
}

impl std::fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rust => write!(f, "rust"),
            Self::Node => write!(f, "node"),
            Self::Python => write!(f, "python"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepEntry {
    pub name: String,
    pub version: String,
}

/// One parsed manifest file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepManifest {
    pub source: String,
    pub kind: ProjectKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub runtime: Vec<DepEntry>,
    pub dev: Vec<DepEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build: Vec<DepEntry>,
}

impl DepManifest {
    pub fn all_deps(&self) -> impl Iterator<Item = &DepEntry> {
        self.runtime.iter().chain(&self.dev).chain(&self.build)
    }
}

/// Parse every manifest present at `project_root`, in a fixed order:
/// Cargo.toml → package.json → manifest.json → pyproject.toml.
/// Missing or malformed files are skipped.
pub fn parse_manifests(project_root: &Path) -> Vec<DepManifest> {
    let parsers: [(&str, fn(&str) -> Option<DepManifest>); 4] = [
        ("Cargo.toml", parse_cargo_toml_content),
        ("package.json", parse_package_json_content),
        ("manifest.json", parse_manifest_json_content),
        ("pyproject.toml", parse_pyproject_toml_content),
    ];

    parsers
        .iter()
        .filter_map(|(file, parse)| {
            let content = fs::read_to_string(project_root.join(file)).ok()?;
            parse(&content)
        })
        .collect()
}

pub fn parse_cargo_toml_content(content: &str) -> Option<DepManifest> {
    let doc: toml::Value = toml::from_str(content).ok()?;
    let package = doc.get("package");
    Some(DepManifest {
        source: "Cargo.toml".to_string(),
        kind: ProjectKind::Rust,
        name: toml_str(package, "name"),
        version: toml_str(package, "version"),
        runtime: toml_deps(doc.get("dependencies")),
        dev: toml_deps(doc.get("dev-dependencies")),
        build: toml_deps(doc.get("build-dependencies")),
    })
}

pub fn parse_package_json_content(content: &str) -> Option<DepManifest> {
    parse_json_manifest(content, "package.json", ProjectKind::Node)
}

/// Generic `manifest.json`: same shape as package.json, no implied ecosystem.
pub fn parse_manifest_json_content(content: &str) -> Option<DepManifest> {
    parse_json_manifest(content, "manifest.json", ProjectKind::Generic)
}

fn parse_json_manifest(content: &str, source: &str, kind: ProjectKind) -> Option<DepManifest> {
    let doc: serde_json::Value = serde_json::from_str(content).ok()?;
    let text = |key: &str| doc.get(key)?.as_str().map(str::to_string);
    Some(DepManifest {
        source: source.to_string(),
        kind,
        name: text("name"),
        version: text("version"),
        runtime: json_deps(doc.get("dependencies")),
        dev: json_deps(doc.get("devDependencies")),
        build: Vec::new(),
    })
}

pub fn parse_pyproject_toml_content(content: &str) -> Option<DepManifest> {
    let doc: toml::Value = toml::from_str(content).ok()?;
    let project = doc.get("project");
    let requirements = project
        .and_then(|p| p.get("dependencies"))
        .and_then(toml::Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    Some(DepManifest {
        source: "pyproject.toml".to_string(),
        kind: ProjectKind::Python,
        name: toml_str(project, "name"),
        version: toml_str(project, "version"),
        runtime: requirements
            .iter()
            .filter_map(toml::Value::as_str)
            .map(|req| {
                let (name, constraint) = split_pep508(req);
                dep(name, Some(constraint))
            })
            .collect(),
        dev: Vec::new(),
        build: Vec::new(),
    })
}

fn dep(name: &str, version: Option<&str>) -> DepEntry {
    DepEntry {
        name: name.to_string(),
        version: version.unwrap_or("*").to_string(),
    }
}

fn toml_str(section: Option<&toml::Value>, key: &str) -> Option<String> {
    section?.get(key)?.as_str().map(str::to_string)
}

/// `name = "1.0"` or `name = { version = "1.0", ... }`; anything else is `*`.
fn toml_deps(section: Option<&toml::Value>) -> Vec<DepEntry> {
    let Some(table) = section.and_then(toml::Value::as_table) else {
        return Vec::new();
    };
    table
        .iter()
        .map(|(name, spec)| {
            let version = spec
                .as_str()
                .or_else(|| spec.get("version").and_then(toml::Value::as_str));
            dep(name, version)
        })
        .collect()
}

fn json_deps(section: Option<&serde_json::Value>) -> Vec<DepEntry> {
    let Some(map) = section.and_then(serde_json::Value::as_object) else {
        return Vec::new();
    };
    map.iter().map(|(name, v)| dep(name, v.as_str())).collect()
}

/// Split a PEP 508 dependency specifier (e.g. "requests>=2.28") into (name, constraint).
pub fn split_pep508(spec: &str) -> (&str, &str) {
    let operators = [">=", "<=", "==", "!=", "~=", ">", "<", "["];
    let pos = operators.iter().filter_map(|op| spec.find(op)).min();
    match pos {
        Some(i) => (spec[..i].trim(), spec[i..].trim()),
        None => (spec.trim(), "*"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cargo_toml_content_extracts_deps_and_package() {
        let toml = r#"
[package]
name = "demo"
version = "0.4.2"

[dependencies]
serde = { version = "1.0", features = ["derive"] }
anyhow = "1.0"

[dev-dependencies]
tempfile = "3"

[build-dependencies]
cc = "1"
"#;
        let manifest = parse_cargo_toml_content(toml).expect("valid Cargo.toml");
        assert_eq!(manifest.name.as_deref(), Some("demo"));
        assert_eq!(manifest.version.as_deref(), Some("0.4.2"));
        assert!(manifest.runtime.iter().any(|d| d.name == "serde"));
        assert!(manifest.dev.iter().any(|d| d.name == "tempfile"));
        assert!(manifest.build.iter().any(|d| d.name == "cc"));
        assert_eq!(
            manifest
                .runtime
                .iter()
                .find(|d| d.name == "serde")
                .map(|d| d.version.as_str()),
            Some("1.0")
        );
        assert_eq!(manifest.all_deps().count(), 4);
    }

    #[test]
    fn parse_package_json_content_extracts_deps() {
        let json = r#"{
  "name": "web",
  "version": "1.2.0",
  "dependencies": { "react": "^18.0.0", "express": "4.18.0" },
  "devDependencies": { "typescript": "5.0.0" }
}"#;
        let manifest = parse_package_json_content(json).expect("valid package.json");
        assert_eq!(manifest.kind, ProjectKind::Node);
        assert_eq!(manifest.version.as_deref(), Some("1.2.0"));
        assert!(manifest.runtime.iter().any(|d| d.name == "react"));
        assert!(manifest.dev.iter().any(|d| d.name == "typescript"));
        assert!(manifest.build.is_empty());
    }

    #[test]
    fn manifest_json_without_deps_still_parses() {
        let manifest = parse_manifest_json_content(r#"{"version":"1.2.0"}"#).unwrap();
        assert_eq!(manifest.kind, ProjectKind::Generic);
        assert_eq!(manifest.version.as_deref(), Some("1.2.0"));
        assert!(manifest.runtime.is_empty());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(parse_package_json_content("{ not json").is_none());
    }

    #[test]
    fn parse_pyproject_toml_content_extracts_deps() {
        let toml = r#"
[project]
name = "myapp"
version = "2.1.0"
dependencies = ["requests>=2.28", "flask==2.0.0", "numpy"]
"#;
        let manifest = parse_pyproject_toml_content(toml).expect("valid pyproject.toml");
        assert_eq!(manifest.name.as_deref(), Some("myapp"));
        let req = manifest
            .runtime
            .iter()
            .find(|d| d.name == "requests")
            .unwrap();
        assert_eq!(req.version, ">=2.28");
        let np = manifest.runtime.iter().find(|d| d.name == "numpy").unwrap();
        assert_eq!(np.version, "*");
    }

    #[test]
    fn split_pep508_handles_various_operators() {
        assert_eq!(split_pep508("requests>=2.28"), ("requests", ">=2.28"));
        assert_eq!(split_pep508("flask==2.0.0"), ("flask", "==2.0.0"));
        assert_eq!(split_pep508("numpy"), ("numpy", "*"));
        assert_eq!(split_pep508("pandas[excel]"), ("pandas", "[excel]"));
        assert_eq!(split_pep508("  scipy  "), ("scipy", "*"));
    }

    #[test]
    fn parse_manifests_reads_in_fixed_order_and_skips_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"version":"3.0.0"}"#).unwrap();
        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"x\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        let manifests = parse_manifests(dir.path());
        let sources: Vec<&str> = manifests.iter().map(|m| m.source.as_str()).collect();
        assert_eq!(sources, vec!["Cargo.toml", "package.json"]);
    }
}
