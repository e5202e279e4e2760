//! Composes the system message sent with every stream.
//!
//! Order is fixed: prelude, environment block, `<custom-instructions>`
//! (global then context, scoped sections stripped), at most one `<mode-*>`
//! block, at most one `<model-*>` block, then any caller-supplied
//! `<additional-instructions>` verbatim.

use std::path::Path;

use crate::error::Result;
use crate::instructions::InstructionDoc;
use crate::instructions::find_mode_section;
use crate::instructions::find_model_section;
use crate::instructions::load_instructions;
use crate::instructions::parse_instruction_doc;

const PRELUDE: &str = "\
You are a coding agent running inside a mux workspace. Respond in \
GitHub-flavored markdown. Keep answers grounded in files you have actually \
read; when you change files, state what changed and where. Use the provided \
tools instead of describing shell commands for the user to run.";

pub struct SystemMessageInputs<'a> {
    pub mux_home: &'a Path,
    /// The workspace's isolated working tree.
    pub workspace_dir: &'a Path,
    /// The originating project; consulted only when the workspace itself has
    /// no instruction file.
    pub project_dir: Option<&'a Path>,
    pub mode: &'a str,
    pub model: &'a str,
    pub additional_instructions: Option<&'a str>,
}

pub async fn build_system_message(inputs: SystemMessageInputs<'_>) -> Result<String> {
    let global = load_doc(inputs.mux_home).await?;
    let context = match load_doc(inputs.workspace_dir).await? {
        Some(doc) => Some(doc),
        None => match inputs.project_dir {
            Some(dir) => load_doc(dir).await?,
            None => None,
        },
    };

    let mut out = String::new();
    out.push_str(PRELUDE);
    out.push_str("\n\n");
    out.push_str(&environment_block(inputs.workspace_dir));

    let custom = custom_instructions_body(global.as_ref(), context.as_ref());
    if !custom.is_empty() {
        out.push_str("\n\n<custom-instructions>\n");
        out.push_str(&custom);
        out.push_str("\n</custom-instructions>");
    }

    // Context-first lookups: a workspace can override what the mux home says
    // for the same mode or model.
    if let Some(body) = lookup(context.as_ref(), global.as_ref(), |doc| {
        find_mode_section(doc, inputs.mode)
    }) {
        let tag = sanitize_tag(inputs.mode);
        out.push_str(&format!("\n\n<mode-{tag}>\n{body}\n</mode-{tag}>"));
    }

    if let Some(body) = lookup(context.as_ref(), global.as_ref(), |doc| {
        find_model_section(doc, inputs.model)
    }) {
        let tag = sanitize_tag(inputs.model);
        out.push_str(&format!("\n\n<model-{tag}>\n{body}\n</model-{tag}>"));
    }

    if let Some(additional) = inputs.additional_instructions
        && !additional.trim().is_empty()
    {
        out.push_str("\n\n<additional-instructions>\n");
        out.push_str(additional);
        out.push_str("\n</additional-instructions>");
    }

    Ok(out)
}

async fn load_doc(dir: &Path) -> Result<Option<InstructionDoc>> {
    Ok(load_instructions(dir)
        .await?
        .map(|raw| parse_instruction_doc(&raw)))
}

fn environment_block(workspace_dir: &Path) -> String {
    format!(
        "<environment>\nWorking directory: {}\nThis workspace is isolated: \
         commands run and files change only inside the working directory. \
         Treat paths outside it as read-only context.\n</environment>",
        workspace_dir.display()
    )
}

fn custom_instructions_body(
    global: Option<&InstructionDoc>,
    context: Option<&InstructionDoc>,
) -> String {
    let mut parts = Vec::new();
    if let Some(doc) = global
        && !doc.unscoped.is_empty()
    {
        parts.push(doc.unscoped.as_str());
    }
    if let Some(doc) = context
        && !doc.unscoped.is_empty()
    {
        parts.push(doc.unscoped.as_str());
    }
    parts.join("\n\n")
}

fn lookup<'a>(
    context: Option<&'a InstructionDoc>,
    global: Option<&'a InstructionDoc>,
    find: impl Fn(&'a InstructionDoc) -> Option<&'a str>,
) -> Option<&'a str> {
    context.and_then(&find).or_else(|| global.and_then(&find))
}

fn sanitize_tag(raw: &str) -> String {
    let mut tag: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while tag.contains("--") {
        tag = tag.replace("--", "-");
    }
    tag.trim_matches('-').to_string()
}
