//! Project fingerprinting: a stable digest of "the state of a project" built
//! from weak signals (key manifests, VC head, directory shape, declared version,
//! framework dependencies and detected tooling).
//!
//! Every input is read best-effort. Unreadable or missing files contribute
//! nothing; the engine never fails on ordinary filesystem variance.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;
use xxhash_rust::xxh3::Xxh3;

use crate::manifest::{self, DepManifest};

/// Key manifest/marker files probed by existence. Order is part of the hash.
pub const KEY_FILES: &[&str] = &[
    "package.json",
    "manifest.json",
    "Cargo.toml",
    "pyproject.toml",
    "requirements.txt",
    "setup.py",
    "go.mod",
    "pom.xml",
    "build.gradle",
    "composer.json",
    "Gemfile",
    "tsconfig.json",
    ".nvmrc",
    ".npmrc",
    "README.md",
];

/// Files or directories whose presence marks a project root.
pub const PROJECT_MARKERS: &[&str] = &[
    ".git",
    "package.json",
    "manifest.json",
    "Cargo.toml",
    "pyproject.toml",
    "setup.py",
    "go.mod",
    "pom.xml",
    "build.gradle",
    "composer.json",
    "Gemfile",
];

/// Directories left out of the directory-shape signal.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    ".cache",
    ".turbo",
    ".venv",
    "venv",
    "__pycache__",
    "coverage",
];

/// Dependencies whose major version is part of the fingerprint.
const MAJOR_FRAMEWORKS: &[&str] = &[
    "react",
    "vue",
    "@angular/core",
    "next",
    "nuxt",
    "svelte",
    "express",
    "fastify",
    "@nestjs/core",
    "typescript",
    "django",
    "flask",
    "fastapi",
    "tokio",
    "axum",
    "actix-web",
    "rocket",
];

/// Dependency name → tool token.
const DEP_TOOLS: &[(&str, &str)] = &[
    ("react", "framework:react"),
    ("vue", "framework:vue"),
    ("@angular/core", "framework:angular"),
    ("next", "framework:next"),
    ("svelte", "framework:svelte"),
    ("express", "framework:express"),
    ("django", "framework:django"),
    ("flask", "framework:flask"),
    ("fastapi", "framework:fastapi"),
    ("axum", "framework:axum"),
    ("actix-web", "framework:actix"),
    ("webpack", "build:webpack"),
    ("vite", "build:vite"),
    ("rollup", "build:rollup"),
    ("esbuild", "build:esbuild"),
    ("typescript", "lang:typescript"),
    ("jest", "test:jest"),
    ("vitest", "test:vitest"),
    ("mocha", "test:mocha"),
    ("pytest", "test:pytest"),
    ("proptest", "test:proptest"),
    ("eslint", "lint:eslint"),
    ("prettier", "lint:prettier"),
    ("ruff", "lint:ruff"),
];

/// Config filename → tool token.
const CONFIG_TOOLS: &[(&str, &str)] = &[
    ("Cargo.toml", "build:cargo"),
    ("tsconfig.json", "lang:typescript"),
    ("webpack.config.js", "build:webpack"),
    ("vite.config.ts", "build:vite"),
    ("vite.config.js", "build:vite"),
    ("Makefile", "build:make"),
    ("Dockerfile", "build:docker"),
    ("jest.config.js", "test:jest"),
    ("jest.config.ts", "test:jest"),
    ("vitest.config.ts", "test:vitest"),
    ("pytest.ini", "test:pytest"),
    (".eslintrc", "lint:eslint"),
    (".eslintrc.js", "lint:eslint"),
    (".eslintrc.json", "lint:eslint"),
    ("eslint.config.js", "lint:eslint"),
    (".prettierrc", "lint:prettier"),
    ("ruff.toml", "lint:ruff"),
    ("rustfmt.toml", "lint:rustfmt"),
    ("clippy.toml", "lint:clippy"),
];

lazy_static! {
    static ref MAJOR_MINOR: Regex =
        Regex::new(r"(\d+)\.(\d+)").expect("valid major.minor regex");
    static ref MAJOR: Regex = Regex::new(r"(\d+)").expect("valid major regex");
}

/// Inventory record for one key file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFileInfo {
    pub path: String,
    pub hash: String,
    pub last_modified: i64,
    pub size: u64,
}

/// Everything derived from one fingerprint pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFingerprint {
    pub hash: String,
    pub key_files: Vec<KeyFileInfo>,
    pub git_head: Option<String>,
}

/// SHA-256 of no input; what a total hashing failure degrades to.
pub fn empty_input_hash() -> String {
    hex::encode(Sha256::digest(b""))
}

pub fn compute_project_hash(project_path: &Path) -> String {
    compute_fingerprint(project_path).hash
}

pub fn compute_fingerprint(project_path: &Path) -> ProjectFingerprint {
    if !project_path.is_dir() {
        return ProjectFingerprint {
            hash: empty_input_hash(),
            key_files: Vec::new(),
            git_head: None,
        };
    }

    let key_files = key_file_inventory(project_path);
    let git_head = read_git_head(project_path);
    let manifests = manifest::parse_manifests(project_path);
    let tools = detect_tools(project_path, &manifests);

    // Directory shape alone does not identify a project state.
    if key_files.is_empty() && git_head.is_none() && tools.is_empty() {
        return ProjectFingerprint {
            hash: empty_input_hash(),
            key_files,
            git_head,
        };
    }

    let key_part = key_files
        .iter()
        .map(|kf| format!("{}:{}", kf.path, kf.hash))
        .collect::<Vec<_>>()
        .join(",");
    let composite = format!(
        "{}|{}|{}|{}|{}|{}",
        key_part,
        git_head.as_deref().unwrap_or(""),
        directory_shape_hash(project_path),
        coarse_version(&manifests).unwrap_or_default(),
        framework_dependency_tokens(&manifests).join(","),
        tools.join(","),
    );

    ProjectFingerprint {
        hash: hex::encode(Sha256::digest(composite.as_bytes())),
        key_files,
        git_head,
    }
}

/// Fast per-key-file digests (xxh3), a lighter audit trail than the project hash.
pub fn compute_file_hashes(project_path: &Path) -> BTreeMap<String, String> {
    KEY_FILES
        .iter()
        .filter_map(|name| {
            let hash = hash_file(&project_path.join(name)).ok()?;
            Some((name.to_string(), format!("{hash:016x}")))
        })
        .collect()
}

/// Walk up from `file_path` to the nearest directory containing a project
/// marker, falling back to the file's own directory.
pub fn find_project_root(file_path: &Path) -> PathBuf {
    let absolute = absolutize(file_path);
    let start = if absolute.is_dir() {
        absolute.clone()
    } else {
        absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| absolute.clone())
    };

    for dir in start.ancestors() {
        if PROJECT_MARKERS.iter().any(|m| dir.join(m).exists()) {
            return canonicalize_lossy(dir);
        }
    }
    canonicalize_lossy(&start)
}

/// Canonicalize when the path exists, otherwise make it absolute.
pub fn canonicalize_lossy(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| absolutize(path))
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

// ── Signals ─────────────────────────────────────────────────────────────────

fn key_file_inventory(root: &Path) -> Vec<KeyFileInfo> {
    KEY_FILES
        .iter()
        .filter_map(|name| {
            let path = root.join(name);
            let bytes = fs::read(&path).ok()?;
            let meta = fs::metadata(&path).ok();
            let last_modified = meta
                .as_ref()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            Some(KeyFileInfo {
                path: name.to_string(),
                hash: hex::encode(Sha256::digest(&bytes)),
                last_modified,
                size: bytes.len() as u64,
            })
        })
        .collect()
}

/// Resolve the VC head to a commit id (or ref name for an unborn branch).
pub fn read_git_head(root: &Path) -> Option<String> {
    let git_dir = resolve_git_dir(root)?;
    let head = fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();

    let Some(reference) = head.strip_prefix("ref:").map(str::trim) else {
        return (!head.is_empty()).then(|| head.to_string());
    };

    // Linked worktrees keep branch refs in the shared repository.
    let common = common_git_dir(&git_dir);
    for dir in [&git_dir, &common] {
        if let Ok(sha) = fs::read_to_string(dir.join(reference)) {
            let sha = sha.trim();
            if !sha.is_empty() {
                return Some(sha.to_string());
            }
        }
    }

    let packed = fs::read_to_string(common.join("packed-refs")).unwrap_or_default();
    packed
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .find_map(|line| {
            let (sha, name) = line.split_once(' ')?;
            (name.trim() == reference).then(|| sha.to_string())
        })
        .or_else(|| Some(reference.to_string()))
}

fn resolve_git_dir(root: &Path) -> Option<PathBuf> {
    let dot_git = root.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    // Worktrees and submodules: `.git` is a file holding `gitdir: <path>`.
    let content = fs::read_to_string(&dot_git).ok()?;
    let target = content.trim().strip_prefix("gitdir:")?.trim();
    let target = Path::new(target);
    Some(if target.is_absolute() {
        target.to_path_buf()
    } else {
        root.join(target)
    })
}

/// `commondir` target of a linked worktree's git dir, else the git dir itself.
fn common_git_dir(git_dir: &Path) -> PathBuf {
    let Ok(raw) = fs::read_to_string(git_dir.join("commondir")) else {
        return git_dir.to_path_buf();
    };
    match raw.trim() {
        "" => git_dir.to_path_buf(),
        rel if Path::new(rel).is_absolute() => PathBuf::from(rel),
        rel => git_dir.join(rel),
    }
}

/// Hash of the sorted immediate-directory listing as `name:kind` pairs.
fn directory_shape_hash(root: &Path) -> String {
    let listing = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let ft = entry.file_type();
            let kind = if ft.is_dir() {
                if EXCLUDED_DIRS.contains(&name.as_str()) {
                    return None;
                }
                "dir"
            } else if ft.is_symlink() {
                "link"
            } else {
                "file"
            };
            Some(format!("{name}:{kind}"))
        })
        .collect::<Vec<_>>()
        .join("\n");
    hex::encode(Sha256::digest(listing.as_bytes()))
}

/// "major.minor" of the first manifest that declares a version.
fn coarse_version(manifests: &[DepManifest]) -> Option<String> {
    manifests.iter().find_map(|m| {
        let version = m.version.as_deref()?;
        let caps = MAJOR_MINOR.captures(version)?;
        Some(format!("{}.{}", &caps[1], &caps[2]))
    })
}

/// Sorted `name@major` tokens for major framework dependencies.
fn framework_dependency_tokens(manifests: &[DepManifest]) -> Vec<String> {
    manifests
        .iter()
        .flat_map(|m| m.all_deps())
        .filter(|dep| MAJOR_FRAMEWORKS.contains(&dep.name.as_str()))
        .map(|dep| {
            let major = MAJOR
                .captures(&dep.version)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| "*".to_string());
            format!("{}@{}", dep.name, major)
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Sorted framework/build/test/lint tokens from dependencies and config files.
pub fn detect_tools(root: &Path, manifests: &[DepManifest]) -> Vec<String> {
    let mut tools = BTreeSet::new();
    for dep in manifests.iter().flat_map(|m| m.all_deps()) {
        if let Some((_, token)) = DEP_TOOLS.iter().find(|(name, _)| *name == dep.name) {
            tools.insert(token.to_string());
        }
    }
    for (file, token) in CONFIG_TOOLS {
        if root.join(file).exists() {
            tools.insert(token.to_string());
        }
    }
    tools.into_iter().collect()
}

fn hash_file(path: &Path) -> std::io::Result<u64> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.digest())
}
