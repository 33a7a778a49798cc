//! Destination-name conflict resolution for downloads.
//!
//! `report.pdf` colliding with an existing file becomes `report.1.pdf`, the
//! next collision `report.2.pdf`, and so on. Multi-part extensions stay
//! together: `data.tar.gz` becomes `data.1.tar.gz`.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Split a file name into `(basename, extension)`, where the extension is
/// everything from the first dot that follows the leading dots.
///
/// `file.tar.gz` -> `("file", ".tar.gz")`, `.bashrc` -> `(".bashrc", "")`.
pub fn split_extension(name: &str) -> (&str, &str) {
    let lead = name.len() - name.trim_start_matches('.').len();
    match name[lead..].find('.') {
        Some(pos) => name.split_at(lead + pos),
        None => (name, ""),
    }
}

/// Sequence number a sibling carries for `basename`/`ext`, if it belongs to
/// the family at all. The unnumbered original counts as `0`.
fn sequence_of(sibling: &str, basename: &str, ext: &str) -> Option<u64> {
    let rest = sibling.strip_prefix(basename)?;
    if rest == ext {
        return Some(0);
    }
    let digits = rest.strip_prefix('.')?.strip_suffix(ext)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Absurdly long runs still belong to the family.
    Some(digits.parse().unwrap_or(0))
}

/// Pick the next free name for `name` given the names already present in the
/// target directory.
pub fn next_available_name<'a, I>(name: &str, siblings: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let (basename, ext) = split_extension(name);
    let next = siblings
        .into_iter()
        .filter_map(|s| sequence_of(s, basename, ext))
        .max()
        .map_or(1, |max| max.saturating_add(1));
    format!("{basename}.{next}{ext}")
}

/// [`next_available_name`] against the live contents of `dir`.
pub fn resolve_in_dir(dir: &Path, name: &str) -> io::Result<PathBuf> {
    let mut siblings = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(s) = entry.file_name().to_str() {
            siblings.push(s.to_string());
        }
    }
    let next = next_available_name(name, siblings.iter().map(String::as_str));
    Ok(dir.join(next))
}

/// Destination paths this process is still writing.
///
/// Claiming runs one caller at a time, so two workers that share a logical
/// name never see the same directory listing and pick the same number. A
/// caller may also wait until another worker's transfer to its path has
/// settled, so a placeholder is never mistaken for a finished file. Writers
/// in other processes are not covered.
#[derive(Default)]
pub struct PathClaims {
    held: Mutex<HashSet<PathBuf>>,
    settled: Condvar,
}

impl PathClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with claiming blocked for everyone else. With `wait`, first
    /// block until nobody holds `key`. If `f` names a path, it stays held
    /// until the returned guard drops.
    pub fn claim_with<T>(
        &self,
        key: &Path,
        wait: bool,
        f: impl FnOnce() -> (T, Option<PathBuf>),
    ) -> (T, Option<HeldPath<'_>>) {
        let mut held = self.held.lock();
        while wait && held.contains(key) {
            self.settled.wait(&mut held);
        }
        let (out, hold) = f();
        let guard = hold.map(|path| {
            held.insert(path.clone());
            HeldPath { claims: self, path }
        });
        (out, guard)
    }

    pub fn is_held(&self, path: &Path) -> bool {
        self.held.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, path: &Path) {
        self.held.lock().remove(path);
        self.settled.notify_all();
    }
}

/// Releases its path on drop, including when the holder unwinds.
pub struct HeldPath<'a> {
    claims: &'a PathClaims,
    path: PathBuf,
}

impl HeldPath<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HeldPath<'_> {
    fn drop(&mut self) {
        self.claims.release(&self.path);
    }
}
