//! Role-specific system prompts for task runners.

use crate::graph::Task;

const COMMON: &str = "\
You are one worker in a team executing a larger goal. You own exactly one task.
Work only on that task. Use the tools to do real work in the working directory:
`exec` runs shell commands, `read_file` and `write_file` access files.
When the task is finished, call `task_done` with a concise summary of the
result and where any artifacts live. If you answer without calling a tool,
your answer is taken as the final output.";

fn role_guidance(role: &str) -> &'static str {
    match role {
        "researcher" => {
            "You are a researcher. Gather facts, verify them, and write findings to a file \
             before summarizing. Cite sources where you have them."
        }
        "coder" | "engineer" => {
            "You are a software engineer. Make small, verifiable changes and run the \
             relevant build or test command before declaring the task done."
        }
        "writer" => {
            "You are a writer. Produce clear, well-structured prose and save the final \
             text to a file."
        }
        "reviewer" => {
            "You are a reviewer. Inspect the work of earlier tasks, list concrete \
             problems, and state whether the work is acceptable."
        }
        "planner" => {
            "You are a planner. Break the problem into concrete steps and record the \
             plan in a file."
        }
        _ => "You are a capable generalist. Pick the most direct route to a correct result.",
    }
}

/// System prompt for `task`'s agent role.
pub fn system_prompt(task: &Task) -> String {
    format!(
        "{}\n\n{COMMON}\n\nTask: {}",
        role_guidance(task.agent_role.as_str()),
        task.title
    )
}

/// First user message: the task description plus outputs of finished dependencies.
pub fn task_brief(task: &Task, dependency_outputs: &[(String, String)]) -> String {
    let mut brief = if task.description.trim().is_empty() {
        task.title.clone()
    } else {
        task.description.clone()
    };
    if !dependency_outputs.is_empty() {
        brief.push_str("\n\nResults of the tasks this one depends on:");
        for (title, output) in dependency_outputs {
            brief.push_str(&format!("\n\n### {title}\n{output}"));
        }
    }
    brief
}
