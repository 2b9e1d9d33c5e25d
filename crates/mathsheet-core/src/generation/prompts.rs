//! Prompt text for the generation service.

use crate::domain::{Difficulty, GeneratedItem};

const FORMAT_RULES: &str = "\
Output MUST be a single JSON object that matches the provided schema.
- 'stem_latex': the problem statement in LaTeX with Japanese prose. Every mathematical \
expression, including single variables, MUST be wrapped in $...$ or \\[...\\]. Do not reveal the answer.
- 'answer_latex': the worked answer with intermediate steps, math wrapped in $...$. No 'Answer:' prefix.
- 'explanation_latex': a short explanation for the student, math wrapped in $...$.
- 'difficulty': one of L1, L2, L3, L4, L5.
- 'unit_id': the unit the problem belongs to.
- 'intent': one sentence describing what the set practises.
- 'point_review_latex': brief review notes shown after the answers.
Never use \\input, \\include, \\write, \\def, \\newcommand, \\usepackage or other preamble commands.
";

/// System prompt for topic-driven batches.
pub fn topic_system_prompt(count: usize) -> String {
    format!(
        "You are an experienced mathematics teacher writing exercise problems for Japanese students.\n\
Generate {} problems for the unit and difficulty given by the user.\n\
Stay strictly within the given unit. Do not include problems from other units.\n{}",
        count, FORMAT_RULES
    )
}

/// User prompt for topic-driven batches.
pub fn topic_user_prompt(
    topic: &str,
    count: usize,
    difficulty: Difficulty,
    extra_instructions: Option<&str>,
) -> String {
    let mut prompt = format!("Unit: {}\nCount: {}\nDifficulty: {}\n", topic, count, difficulty);
    if let Some(extra) = extra_instructions.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("Additional instructions: ");
        prompt.push_str(extra);
        prompt.push('\n');
    }
    prompt
}

/// System prompt for rewriting or replacing a single problem.
pub fn regenerate_system_prompt() -> String {
    format!(
        "You are an experienced mathematics teacher editing a worksheet for Japanese students.\n\
Produce exactly one replacement problem that follows the editor's instruction.\n{}",
        FORMAT_RULES
    )
}

pub fn regenerate_user_prompt(
    prior: Option<&GeneratedItem>,
    instruction: &str,
    topic: &str,
    difficulty: Difficulty,
) -> String {
    let mut prompt = format!("Unit: {}\nDifficulty: {}\nCount: 1\n", topic, difficulty);
    if let Some(prior) = prior {
        prompt.push_str("Current problem:\n");
        prompt.push_str(&format!("  stem: {}\n", prior.stem_text));
        prompt.push_str(&format!("  answer: {}\n", prior.answer_text));
        if prior.has_explanation() {
            prompt.push_str(&format!("  explanation: {}\n", prior.explanation_text));
        }
    }
    prompt.push_str("Instruction: ");
    prompt.push_str(instruction.trim());
    prompt.push('\n');
    prompt
}

/// Default system prompt for free-form requests with reference material.
pub fn free_prompt_system_prompt() -> String {
    format!(
        "You are a mathematics teacher and editor.\n\
Write problems that follow the user's instructions, using any attached images or text \
as a guide for topic, difficulty and style. Use Japanese for all prose.\n{}",
        FORMAT_RULES
    )
}

/// Pin the batch size onto a caller-supplied system prompt.
pub fn with_count(system_prompt: &str, count: usize) -> String {
    format!("{}\n\nGenerate exactly {} problems.", system_prompt.trim_end(), count)
}

/// System prompt for tutor feedback on one problem.
pub fn feedback_system_prompt() -> String {
    "You are a helpful tutor giving feedback on a mathematics problem for Japanese students.\n\
Write an explanation, a hint that does not give the answer away, and the most common mistake.\n\
Output MUST be a single JSON object that matches the provided schema. Use Japanese prose and wrap \
every mathematical expression in $...$. Echo the given question id in 'question_id'.\n\
Never use \\input, \\include, \\write, \\def, \\newcommand, \\usepackage or other preamble commands.\n"
        .to_string()
}

pub fn feedback_user_prompt(question_id: &str, item: &GeneratedItem) -> String {
    format!(
        "Question id: {}\nProblem: {}\nAnswer: {}\nDifficulty: {}\n",
        question_id, item.stem_text, item.answer_text, item.difficulty
    )
}
