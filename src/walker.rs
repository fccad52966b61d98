//! Directory traversal and file filtering.
//!
//! [`walk`] produces, in one pass over the tree, the ordered list of files to
//! extract and the lines of the tree manifest. A file is included when its
//! basename is one of [`SPECIAL_BASENAMES`] or its extension (case-insensitive)
//! is in [`ALLOWED_EXTENSIONS`]. Directories named in [`IGNORED_DIRS`] are
//! pruned before descent.
//!
//! Within each directory, files come first and then subdirectories, each
//! group sorted by name, so output order is stable for a given snapshot.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

use crate::config::ExtractConfig;

/// Extensions (without the dot, lowercase) of files worth indexing.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "py", "ipynb", "js", "mjs", "cjs", "ts", "tsx", "jsx", "vue", "svelte", "java", "kt", "kts",
    "scala", "go", "rs", "c", "h", "cpp", "cc", "cxx", "hpp", "hh", "m", "mm", "cs", "fs", "fsx",
    "php", "rb", "swift", "lua", "pl", "pm", "r", "dart", "groovy", "gradle", "sql", "proto",
    "graphql", "gql", "json", "json5", "toml", "ini", "cfg", "conf", "yaml", "yml", "env",
    "properties", "xml", "html", "htm", "css", "scss", "sass", "less", "md", "markdown", "rst",
    "adoc", "txt", "csv", "tsv", "log", "org",
];

/// Build and config files included regardless of extension, with the
/// language tag each one is classified as. Matched case-sensitively.
pub const SPECIAL_BASENAMES: &[(&str, &str)] = &[
    ("Dockerfile", "dockerfile"),
    ("Makefile", "make"),
    ("CMakeLists.txt", "cmake"),
    ("BUILD", "bazel"),
    ("WORKSPACE", "bazel"),
    ("Podfile", "cocoapods"),
    ("Gemfile", "ruby-gems"),
    ("requirements.txt", "python-reqs"),
    ("environment.yml", "conda-env"),
    ("Pipfile", "pipenv"),
    ("Pipfile.lock", "pipenv-lock"),
    ("package.json", "npm"),
    ("pnpm-lock.yaml", "pnpm-lock"),
    ("yarn.lock", "yarn-lock"),
    ("poetry.lock", "poetry-lock"),
    ("pyproject.toml", "pyproject"),
    ("Cargo.toml", "cargo"),
    ("Cargo.lock", "cargo-lock"),
    ("go.mod", "gomod"),
    ("go.sum", "gosum"),
    ("composer.json", "composer"),
    ("composer.lock", "composer-lock"),
    ("pom.xml", "maven"),
    ("build.gradle.kts", "gradle-kts"),
    ("build.gradle", "gradle"),
    (".gitignore", "git"),
    (".gitattributes", "git"),
    (".editorconfig", "editor"),
];

/// Directory names never descended into.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".bzr",
    "node_modules",
    "dist",
    "build",
    "out",
    "target",
    ".idea",
    ".vscode",
    ".vs",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    ".gradle",
    ".next",
    ".nuxt",
    ".parcel-cache",
];

const INDENT: &str = "    ";

/// Result of one traversal.
#[derive(Debug, Default)]
pub struct Walk {
    /// Included files, absolute if the root was absolute.
    pub files: Vec<PathBuf>,
    /// Manifest lines below the root name: directories and included files.
    pub tree: Vec<String>,
}

impl Walk {
    /// Render the manifest text: the root's name followed by the tree lines.
    pub fn manifest_text(&self, root: &Path) -> String {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string());
        std::iter::once(name)
            .chain(self.tree.iter().cloned())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Language tag for a special basename, if `name` is one.
pub fn special_language(name: &str) -> Option<&'static str> {
    SPECIAL_BASENAMES
        .iter()
        .find(|(special, _)| *special == name)
        .map(|(_, lang)| *lang)
}

pub fn is_ignored_dir(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

/// Whether a file should be extracted, judged by its name alone.
pub fn is_allowed_file(path: &Path) -> bool {
    let name = match path.file_name() {
        Some(n) => n.to_string_lossy(),
        None => return false,
    };
    if special_language(&name).is_some() {
        return true;
    }
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            ALLOWED_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

/// Traverse `root`, returning included files and manifest lines.
///
/// Unreadable entries and symlink loops are logged and skipped.
pub fn walk(root: &Path, config: &ExtractConfig) -> Result<Walk> {
    let exclude_set = build_globset(&config.exclude_globs)?;
    let mut out = Walk::default();

    let walker = WalkDir::new(root)
        .follow_links(config.follow_symlinks)
        .sort_by(files_then_dirs)
        .into_iter()
        .filter_entry(|e| keep_entry(e, root, &exclude_set));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                if let Some(ancestor) = err.loop_ancestor() {
                    warn!(
                        path = ?err.path(),
                        ancestor = %ancestor.display(),
                        "symlink loop, not descending"
                    );
                } else {
                    warn!(error = %err, "skipping unreadable entry");
                }
                continue;
            }
        };

        if entry.depth() == 0 {
            continue;
        }

        let indent = INDENT.repeat(entry.depth() - 1);
        let name = entry.file_name().to_string_lossy();

        if entry.file_type().is_dir() {
            out.tree.push(format!("{}└── {}", indent, name));
            continue;
        }

        if !entry.file_type().is_file() || !is_allowed_file(entry.path()) {
            continue;
        }

        out.tree.push(format!("{}├── {}", indent, name));
        out.files.push(entry.into_path());
    }

    Ok(out)
}

fn keep_entry(entry: &DirEntry, root: &Path, exclude_set: &GlobSet) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    if entry.file_type().is_dir() && is_ignored_dir(&entry.file_name().to_string_lossy()) {
        return false;
    }
    if exclude_set.is_empty() {
        return true;
    }
    let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
    !exclude_set.is_match(relative)
}

fn files_then_dirs(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.file_type()
        .is_dir()
        .cmp(&b.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
