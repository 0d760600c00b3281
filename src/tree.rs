//! Folder-tree projection over flat object listings, plus the search and
//! filter rules applied to file lists.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MIN_SEARCH_TERM_CHARS;
use crate::objects::ObjectEntry;

/// A file (or folder marker) as presented to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Key relative to the owner's root (user, group or sharer).
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    /// Full object key.
    pub redirect_key: String,
}

impl FileRecord {
    /// Builds records for `entries` below `root`; the root marker itself and
    /// keys outside `root` are skipped.
    pub fn from_entries(root: &str, entries: Vec<ObjectEntry>) -> Vec<FileRecord> {
        Self::from_entries_with_label(root, "", entries)
    }

    /// Like [`FileRecord::from_entries`], prefixing every relative key with
    /// `label`.
    pub fn from_entries_with_label(
        root: &str,
        label: &str,
        entries: Vec<ObjectEntry>,
    ) -> Vec<FileRecord> {
        entries
            .into_iter()
            .filter_map(|entry| {
                let relative = entry.key.strip_prefix(root)?;
                if relative.is_empty() {
                    return None;
                }
                Some(FileRecord {
                    key: format!("{label}{relative}"),
                    size: entry.size,
                    last_modified: entry.last_modified,
                    redirect_key: entry.key.clone(),
                })
            })
            .collect()
    }

    pub fn is_folder(&self) -> bool {
        self.key.ends_with('/')
    }

    fn extension(&self) -> Option<String> {
        let name = self.key.rsplit('/').next()?;
        let (_, ext) = name.rsplit_once('.')?;
        Some(ext.to_ascii_lowercase())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub name: String,
    /// Relative folder path, always ending with `/`.
    pub key: String,
    pub redirect_key: String,
    pub files: Vec<FileRecord>,
    pub folders: Vec<Folder>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Tree {
    pub folders: Vec<Folder>,
    /// Files that sit directly at the root.
    pub files: Vec<FileRecord>,
}

/// Object key of a folder, given a file's object key and the part of its
/// display key below that folder. Display keys may carry a label instead of
/// the storage root, so only the shared suffix is trusted.
fn folder_redirect<'a>(redirect_key: &'a str, below: &str) -> Option<&'a str> {
    redirect_key
        .strip_suffix(below)
        .filter(|prefix| prefix.ends_with('/'))
}

/// Rebuilds the folder hierarchy implied by a flat list of keys.
///
/// Every `/`-separated segment except the last names a folder; the last
/// names a file unless the key ends with `/`. Folders appear in first-seen
/// order and are created once per path prefix.
pub fn build_tree(records: &[FileRecord]) -> Tree {
    // Arena of folders indexed by relative path; children are arena indices.
    struct Node {
        folder: Folder,
        children: Vec<usize>,
    }

    let mut nodes: Vec<Node> = Vec::new();
    let mut by_path: HashMap<String, usize> = HashMap::new();
    let mut roots: Vec<usize> = Vec::new();
    let mut root_files = Vec::new();

    for record in records {
        let segments: Vec<&str> = record.key.split('/').collect();
        let last = segments.len() - 1;
        let mut path = String::new();
        let mut current: Option<usize> = None;
        // Byte offset of the current segment inside `record.key`.
        let mut offset = 0;

        for (index, segment) in segments.iter().enumerate() {
            let segment_end = offset + segment.len();
            offset = segment_end + 1;
            if segment.is_empty() {
                continue;
            }
            if index == last && !record.is_folder() {
                match current {
                    Some(node) => nodes[node].folder.files.push(record.clone()),
                    None => root_files.push(record.clone()),
                }
                continue;
            }

            path.push_str(segment);
            path.push('/');
            let node = match by_path.get(&path) {
                Some(&node) => node,
                None => {
                    let below = record.key.get(segment_end + 1..).unwrap_or("");
                    let redirect_key = folder_redirect(&record.redirect_key, below)
                        .unwrap_or(&path)
                        .to_string();
                    nodes.push(Node {
                        folder: Folder {
                            name: segment.to_string(),
                            key: path.clone(),
                            redirect_key,
                            ..Folder::default()
                        },
                        children: Vec::new(),
                    });
                    let node = nodes.len() - 1;
                    by_path.insert(path.clone(), node);
                    match current {
                        Some(parent) => nodes[parent].children.push(node),
                        None => roots.push(node),
                    }
                    node
                }
            };
            current = Some(node);
        }
    }

    fn assemble(nodes: &mut Vec<Option<Node>>, index: usize) -> Folder {
        let Some(node) = nodes[index].take() else {
            return Folder::default();
        };
        let mut folder = node.folder;
        folder.folders = node
            .children
            .into_iter()
            .map(|child| assemble(nodes, child))
            .collect();
        folder
    }

    let mut slots: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();
    Tree {
        folders: roots
            .into_iter()
            .map(|root| assemble(&mut slots, root))
            .collect(),
        files: root_files,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Images,
    Pdfs,
    Text,
    Spreadsheets,
    Presentations,
    Audio,
    Video,
    Compressed,
    Code,
    Executables,
}

impl FileCategory {
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            FileCategory::Images => &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "svg", "webp"],
            FileCategory::Pdfs => &["pdf"],
            FileCategory::Text => &["txt", "doc", "docx", "rtf", "odt"],
            FileCategory::Spreadsheets => &["xls", "xlsx", "csv", "ods"],
            FileCategory::Presentations => &["ppt", "pptx", "odp"],
            FileCategory::Audio => &["mp3", "wav", "aac", "flac", "ogg", "m4a"],
            FileCategory::Video => &["mp4", "avi", "mkv", "mov", "wmv", "flv"],
            FileCategory::Compressed => &["zip", "rar", "7z", "tar", "gz"],
            FileCategory::Code => &[
                "js", "ts", "html", "css", "py", "java", "cpp", "c", "rb", "php", "go",
            ],
            FileCategory::Executables => &["exe", "msi", "bin", "dmg", "sh", "apk"],
        }
    }
}

impl FromStr for FileCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let category = match value.trim().to_ascii_lowercase().as_str() {
            "images" => FileCategory::Images,
            "pdfs" => FileCategory::Pdfs,
            "text" => FileCategory::Text,
            "spreadsheets" => FileCategory::Spreadsheets,
            "presentations" => FileCategory::Presentations,
            "audio" => FileCategory::Audio,
            "video" => FileCategory::Video,
            "compressed" => FileCategory::Compressed,
            "code" => FileCategory::Code,
            "executables" => FileCategory::Executables,
            other => return Err(format!("unknown file type: {other}")),
        };
        Ok(category)
    }
}

/// Query parameters accepted by listing routes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterQuery {
    /// Comma separated categories.
    pub types: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    /// `YYYY-MM-DD`
    pub start_date: Option<String>,
    /// `YYYY-MM-DD`, inclusive
    pub end_date: Option<String>,
    pub search: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct FileFilter {
    pub types: BTreeSet<FileCategory>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub end: Option<DateTime<Utc>>,
    pub search: Option<String>,
}

impl FileFilter {
    pub fn from_query(query: &FilterQuery) -> Result<Self, String> {
        let mut types = BTreeSet::new();
        if let Some(raw) = query.types.as_deref() {
            for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
                types.insert(part.parse()?);
            }
        }
        let start = query
            .start_date
            .as_deref()
            .map(parse_day)
            .transpose()?
            .map(|day| day.and_time(chrono::NaiveTime::MIN).and_utc());
        let end = query
            .end_date
            .as_deref()
            .map(parse_day)
            .transpose()?
            .and_then(|day| day.checked_add_days(Days::new(1)))
            .map(|day| day.and_time(chrono::NaiveTime::MIN).and_utc());
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|term| term.chars().count() >= MIN_SEARCH_TERM_CHARS)
            .map(str::to_string);

        Ok(Self {
            types,
            min_size: query.min_size,
            max_size: query.max_size,
            start,
            end,
            search,
        })
    }

    pub fn matches(&self, record: &FileRecord) -> bool {
        if !self.types.is_empty() {
            let Some(ext) = record.extension() else {
                return false;
            };
            if !self
                .types
                .iter()
                .any(|category| category.extensions().contains(&ext.as_str()))
            {
                return false;
            }
        }
        if self.min_size.is_some_and(|min| record.size < min)
            || self.max_size.is_some_and(|max| record.size > max)
        {
            return false;
        }
        if self.start.is_some() || self.end.is_some() {
            let Some(modified) = record.last_modified else {
                return false;
            };
            if self.start.is_some_and(|start| modified < start)
                || self.end.is_some_and(|end| modified >= end)
            {
                return false;
            }
        }
        true
    }

    /// Applies filters and search; with a search term results are ordered
    /// best match first.
    pub fn apply(&self, records: Vec<FileRecord>) -> Vec<FileRecord> {
        let filtered = records.into_iter().filter(|record| self.matches(record));
        let Some(term) = self.search.as_deref() else {
            return filtered.collect();
        };
        let mut scored: Vec<(u32, FileRecord)> = filtered
            .filter_map(|record| fuzzy_score(&record.key, term).map(|score| (score, record)))
            .collect();
        scored.sort_by_key(|(score, _)| *score);
        scored.into_iter().map(|(_, record)| record).collect()
    }
}

fn parse_day(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| format!("invalid date: {value}"))
}

const SUBSEQUENCE_PENALTY: u32 = 1000;

/// Scores how well `term` matches `haystack`; lower is better.
///
/// Substring hits score by position. Otherwise the term must appear as a
/// subsequence whose gaps total at most twice the term length; such hits
/// score after every substring hit.
pub fn fuzzy_score(haystack: &str, term: &str) -> Option<u32> {
    let haystack = haystack.to_lowercase();
    let term = term.to_lowercase();
    if term.is_empty() {
        return Some(0);
    }
    if let Some(position) = haystack.find(&term) {
        return Some(haystack[..position].chars().count() as u32);
    }

    let hay: Vec<char> = haystack.chars().collect();
    let needle: Vec<char> = term.chars().collect();
    let max_gap = needle.len() * 2;
    let mut best: Option<usize> = None;

    for start in 0..hay.len() {
        if hay[start] != needle[0] {
            continue;
        }
        let mut matched = 1;
        let mut end = start;
        for (offset, ch) in hay.iter().enumerate().skip(start + 1) {
            if matched == needle.len() {
                break;
            }
            if *ch == needle[matched] {
                matched += 1;
                end = offset;
            }
        }
        if matched == needle.len() {
            let gaps = end + 1 - start - needle.len();
            if gaps <= max_gap && best.is_none_or(|b| gaps < b) {
                best = Some(gaps);
            }
        }
    }

    best.map(|gaps| SUBSEQUENCE_PENALTY + gaps as u32)
}
