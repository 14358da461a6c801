//! Hygiene: source rules the compiler cannot enforce.
//!
//! Each rule scans the production tree under `src/`. Test files and inline
//! `#[cfg(test)]` modules are skipped.

use std::fs;
use std::path::Path;

struct SourceFile {
    path: String,
    content: String,
}

impl SourceFile {
    fn is(&self, suffix: &str) -> bool {
        self.path.replace('\\', "/").ends_with(suffix)
    }

    fn lines_matching<'a>(&'a self, pred: impl Fn(&str) -> bool + 'a) -> impl Iterator<Item = (usize, &'a str)> + 'a {
        self.content
            .lines()
            .enumerate()
            .filter(move |&(_, line)| pred(line))
            .map(|(i, line)| (i + 1, line.trim()))
    }
}

fn source_files() -> Vec<SourceFile> {
    let mut files = Vec::new();
    collect_rs_files(Path::new("src"), &mut files);
    files
}

fn collect_rs_files(dir: &Path, out: &mut Vec<SourceFile>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rs_files(&path, out);
        } else if path.extension().is_some_and(|e| e == "rs") {
            let path_str = path.to_string_lossy().to_string();
            if path_str.ends_with("_test.rs") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(&path) {
                out.push(SourceFile { path: path_str, content: production_part(&content) });
            }
        }
    }
}

/// Inline `#[cfg(test)]` modules sit at the bottom of a file; drop them.
fn production_part(content: &str) -> String {
    content
        .lines()
        .take_while(|line| !line.starts_with("#[cfg(test)]"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn report(rule: &str, hits: &[String]) {
    assert!(hits.is_empty(), "{rule}:\n{}", hits.join("\n"));
}

#[test]
fn production_code_never_panics() {
    let patterns = [".unwrap()", ".expect(", "panic!(", "unreachable!(", "todo!(", "unimplemented!("];
    let mut hits = Vec::new();
    for file in source_files() {
        for (n, line) in file.lines_matching(|l| patterns.iter().any(|p| l.contains(p))) {
            hits.push(format!("  {}:{n}: {line}", file.path));
        }
    }
    report("panicking call in production code", &hits);
}

#[test]
fn logical_clocks_advance_with_checked_arithmetic() {
    let mut hits = Vec::new();
    for file in source_files() {
        for (n, line) in file.lines_matching(|l| l.contains("clock +=") || l.contains("clock + 1")) {
            hits.push(format!("  {}:{n}: {line}", file.path));
        }
    }
    report("clock advanced without checked_add", &hits);
}

/// A discarded result is only fine where the receiver going away is
/// expected: oneshot replies, link events, and leaves for a room that is
/// already gone.
#[test]
fn discarded_sends_are_limited_to_vanishing_receivers() {
    let allowed = ["reply.send(", "events.send(", "send(RoomCommand::Leave"];
    let mut hits = Vec::new();
    for file in source_files() {
        let discards = file.lines_matching(|l| l.contains("let _ =") && !allowed.iter().any(|a| l.contains(a)));
        for (n, line) in discards {
            hits.push(format!("  {}:{n}: {line}", file.path));
        }
    }
    report("discarded result; frames to members go through reply or detach", &hits);
}

#[test]
fn frame_queue_sends_are_never_discarded() {
    let mut hits = Vec::new();
    for file in source_files() {
        for (n, line) in file.lines_matching(|l| l.contains("try_send(") && l.contains("let _")) {
            hits.push(format!("  {}:{n}: {line}", file.path));
        }
    }
    report("full member queue ignored instead of dropping the member", &hits);
}

#[test]
fn lenient_parsing_stays_at_the_edges() {
    let edges = ["src/config.rs", "src/routes/ws.rs"];
    let mut hits = Vec::new();
    for file in source_files().into_iter().filter(|f| !edges.iter().any(|e| f.is(e))) {
        for (n, line) in file.lines_matching(|l| l.contains(".ok()")) {
            hits.push(format!("  {}:{n}: {line}", file.path));
        }
    }
    report(".ok() swallows an error outside env and query parsing", &hits);
}

#[test]
fn poisoned_locks_are_recovered() {
    let mut hits = Vec::new();
    for file in source_files() {
        let mut rest = file.content.as_str();
        while let Some(at) = rest.find(".lock()") {
            let tail = rest[at + ".lock()".len()..].trim_start();
            if !tail.starts_with(".unwrap_or_else(PoisonError::into_inner)") {
                let line = file.content.len() - rest.len() + at;
                let n = file.content[..line].lines().count();
                hits.push(format!("  {}:{n}", file.path));
            }
            rest = &rest[at + 1..];
        }
    }
    report("mutex lock without poison recovery", &hits);
}

#[test]
fn no_dead_code_allowances() {
    let mut hits = Vec::new();
    for file in source_files() {
        for (n, line) in file.lines_matching(|l| l.contains("#[allow(dead_code)]")) {
            hits.push(format!("  {}:{n}: {line}", file.path));
        }
    }
    report("#[allow(dead_code)] in production code", &hits);
}
