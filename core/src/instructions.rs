//! Instruction-file discovery and scoped-section parsing.
//!
//! Instruction files live at the mux home (global) and at each workspace
//! root (context). A file may contain *scoped sections*: headings named
//! `Mode: <name>` or `Model: <pattern>` whose body only applies when the
//! active mode or model matches. Everything else is unscoped and flows into
//! the `<custom-instructions>` block verbatim.

use std::path::Path;

use regex::Regex;
use regex::RegexBuilder;
use tracing::warn;

use crate::error::Result;

/// Larger files are silently truncated to this size so a runaway
/// instruction file never blows the context window.
pub(crate) const INSTRUCTIONS_MAX_BYTES: usize = 32 * 1024;

/// First found wins.
const CANDIDATE_FILENAMES: &[&str] = &["AGENTS.md", "AGENT.md", "CLAUDE.md"];

/// Appended after the primary when the primary was found.
const LOCAL_FILENAME: &str = "AGENTS.local.md";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SectionKind {
    Mode(String),
    Model(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScopedSection {
    pub kind: SectionKind,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct InstructionDoc {
    /// The document with scoped sections removed.
    pub unscoped: String,
    pub sections: Vec<ScopedSection>,
}

pub(crate) fn strip_html_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn heading_of(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    // `#tag` is not a heading; `#` and `# title` are.
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    Some((level, rest.trim()))
}

fn scoped_kind_of(title: &str) -> Option<SectionKind> {
    let lower = title.to_ascii_lowercase();
    if lower.starts_with("mode:") {
        return Some(SectionKind::Mode(title["mode:".len()..].trim().to_string()));
    }
    if lower.starts_with("model:") {
        return Some(SectionKind::Model(
            title["model:".len()..].trim().to_string(),
        ));
    }
    None
}

/// Split a document into its unscoped remainder and its scoped sections.
/// HTML comments are stripped before any parsing.
pub(crate) fn parse_instruction_doc(raw: &str) -> InstructionDoc {
    let text = strip_html_comments(raw);
    let mut unscoped = String::new();
    let mut sections = Vec::new();

    let mut active: Option<(usize, SectionKind, String)> = None;
    for line in text.lines() {
        if let Some((level, title)) = heading_of(line) {
            // A heading of the same or higher level ends the active section.
            if let Some((active_level, _, _)) = &active
                && level <= *active_level
            {
                if let Some((_, kind, body)) = active.take() {
                    sections.push(ScopedSection {
                        kind,
                        body: body.trim().to_string(),
                    });
                }
            }
            if active.is_none() {
                if let Some(kind) = scoped_kind_of(title) {
                    active = Some((level, kind, String::new()));
                    continue;
                }
            }
        }
        match &mut active {
            Some((_, _, body)) => {
                body.push_str(line);
                body.push('\n');
            }
            None => {
                unscoped.push_str(line);
                unscoped.push('\n');
            }
        }
    }
    if let Some((_, kind, body)) = active.take() {
        sections.push(ScopedSection {
            kind,
            body: body.trim().to_string(),
        });
    }

    InstructionDoc {
        unscoped: unscoped.trim().to_string(),
        sections,
    }
}

/// First `Mode:` section matching `mode` (case-insensitive).
pub(crate) fn find_mode_section<'a>(doc: &'a InstructionDoc, mode: &str) -> Option<&'a str> {
    doc.sections.iter().find_map(|section| match &section.kind {
        SectionKind::Mode(name) if name.eq_ignore_ascii_case(mode) => Some(section.body.as_str()),
        _ => None,
    })
}

/// First `Model:` section whose pattern matches `model`. Patterns are plain
/// regexes or `/pattern/flags` (only the `i` flag is honored); invalid
/// regexes are skipped rather than raised.
pub(crate) fn find_model_section<'a>(doc: &'a InstructionDoc, model: &str) -> Option<&'a str> {
    doc.sections.iter().find_map(|section| match &section.kind {
        SectionKind::Model(pattern) => {
            let regex = compile_model_pattern(pattern)?;
            regex.is_match(model).then_some(section.body.as_str())
        }
        _ => None,
    })
}

fn compile_model_pattern(pattern: &str) -> Option<Regex> {
    let (body, case_insensitive) = match pattern.strip_prefix('/') {
        Some(rest) => {
            let end = rest.rfind('/')?;
            let flags = &rest[end + 1..];
            (&rest[..end], flags.contains('i'))
        }
        None => (pattern, false),
    };
    match RegexBuilder::new(body)
        .case_insensitive(case_insensitive)
        .build()
    {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!(pattern, error = %e, "ignoring invalid model pattern");
            None
        }
    }
}

/// Load the instruction text for one directory: the first candidate file
/// found, with `AGENTS.local.md` appended when a primary exists.
pub(crate) async fn load_instructions(dir: &Path) -> Result<Option<String>> {
    let Some(mut contents) = load_first_candidate(dir).await? else {
        return Ok(None);
    };
    if let Some(local) = load_capped(&dir.join(LOCAL_FILENAME)).await? {
        contents.push('\n');
        contents.push_str(&local);
    }
    Ok(Some(contents))
}

async fn load_first_candidate(dir: &Path) -> Result<Option<String>> {
    for name in CANDIDATE_FILENAMES {
        if let Some(contents) = load_capped(&dir.join(name)).await? {
            return Ok(Some(contents));
        }
    }
    Ok(None)
}

async fn load_capped(path: &Path) -> Result<Option<String>> {
    use tokio::io::AsyncReadExt;

    let file = match tokio::fs::File::open(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
        Ok(f) => f,
    };
    let size = file.metadata().await?.len();
    let mut data = Vec::with_capacity(std::cmp::min(size as usize, INSTRUCTIONS_MAX_BYTES));
    let mut limited = tokio::io::BufReader::new(file).take(INSTRUCTIONS_MAX_BYTES as u64);
    limited.read_to_end(&mut data).await?;
    if size as usize > INSTRUCTIONS_MAX_BYTES {
        warn!(
            "instruction file `{}` exceeds {INSTRUCTIONS_MAX_BYTES} bytes - truncating",
            path.display(),
        );
    }
    let contents = String::from_utf8_lossy(&data).to_string();
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(contents))
}
