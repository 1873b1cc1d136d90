//! Root prompt assembly.

use serde_json::Value;
use serde_json::json;

use rlm_protocol::BudgetSnapshot;
use rlm_protocol::ConsumedBudget;
use rlm_protocol::OutputMode;
use rlm_protocol::StepError;

use crate::state::summarize_state;

const SYSTEM_PROMPT: &str = "\
You operate a document corpus through short Python programs. Each reply must \
contain exactly one fenced code block tagged `repl` and nothing else.

Inside the block you can use:
- `context`: the corpus. `len(context)` is the document count; `context[i]` \
is a document. `doc[a:b]` or `doc.slice(a, b, tag=None)` returns text and \
records what you read. `doc.find(needle, start=, end=, max_hits=, tag=)` and \
`doc.regex(pattern, ...)` return (start, end) hit ranges. `doc.sections()` \
and `doc.page_spans()` expose structure.
- `state`: a JSON dict persisted between turns. Keys starting with `_` are \
owned by the runtime and read-only.
- `print(...)`: captured and shown to you next turn.
- Plain Python: ints, floats, strings, lists, dicts (string keys), loops, \
conditionals, functions, comprehensions. No imports, no file or network \
access, no dunder attributes.";

const SUBCALLS_SECTION: &str = "\
Tool calls are queued, never resolved in-step:
- `tool.queue_llm(key, prompt, model_hint=None, max_tokens=None, \
temperature=None, metadata=None)` queues a sub-LLM call.
- `tool.queue_search(key, query, k=8, filters=None)` queues a search.
- `tool.YIELD(reason=None)` ends the step; queued calls resolve and results \
appear in `state['_tool_results']` with statuses in `state['_tool_status']`.
- `tool.FINAL(answer)` ends the execution with your answer.";

const NO_SUBCALLS_SECTION: &str = "\
Sub-LLM calls are disabled for this execution. Work directly over the corpus \
and finish with `tool.FINAL(answer)`; `tool.YIELD(reason=None)` ends a step \
early when you want another look at state and stdout.";

const CONTEXTS_SECTION: &str = "\
Output mode is CONTEXTS: instead of composing an answer, mark every span the \
caller should receive by reading it with a `context` tag, e.g. \
`doc.slice(a, b, tag='context')` or `tag='context:quote'`. When you are done \
call `tool.FINAL(None)`; the tagged spans themselves are the result.";

pub struct PromptInputs<'a> {
    pub question: &'a str,
    pub doc_lens: &'a [usize],
    pub subcalls_enabled: bool,
    pub output_mode: OutputMode,
    pub state: &'a Value,
    pub last_stdout: Option<&'a str>,
    pub last_error: Option<&'a StepError>,
    pub budgets: &'a BudgetSnapshot,
    pub consumed: &'a ConsumedBudget,
    pub turn_index: u32,
}

/// Render the JSON tool schema injected into `state["_tool_schema"]`.
pub fn tool_schema() -> Value {
    json!({
        "llm": {
            "queue": "tool.queue_llm(key, prompt, model_hint=None, max_tokens=None, temperature=None, metadata=None)",
            "results": "_tool_results.llm[key] = {text, model, cached}",
        },
        "search": {
            "queue": "tool.queue_search(key, query, k=8, filters=None)",
            "results": "_tool_results.search[key] = {hits: [{doc_index, start_char, end_char, score, preview}]}",
        },
        "status": "_tool_status[key] in {pending, resolved, error}",
    })
}

pub fn build_root_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut prompt = String::with_capacity(4 * 1024);
    prompt.push_str(SYSTEM_PROMPT);
    prompt.push_str("\n\n");
    prompt.push_str(if inputs.subcalls_enabled {
        SUBCALLS_SECTION
    } else {
        NO_SUBCALLS_SECTION
    });
    if inputs.output_mode == OutputMode::Contexts {
        prompt.push_str("\n\n");
        prompt.push_str(CONTEXTS_SECTION);
    }

    prompt.push_str("\n\n## Question\n");
    prompt.push_str(inputs.question);

    prompt.push_str("\n\n## Corpus\n");
    prompt.push_str(&format!("{} document(s); lengths in chars: ", inputs.doc_lens.len()));
    let lens: Vec<String> = inputs
        .doc_lens
        .iter()
        .enumerate()
        .map(|(i, len)| format!("[{i}] {len}"))
        .collect();
    prompt.push_str(&lens.join(", "));

    let summary = summarize_state(inputs.state);
    prompt.push_str("\n\n## State summary (key: bytes)\n");
    match serde_json::to_string(&summary) {
        Ok(rendered) => prompt.push_str(&rendered),
        Err(_) => prompt.push_str("{}"),
    }

    if let Some(stdout) = inputs.last_stdout {
        if !stdout.is_empty() {
            prompt.push_str("\n\n## Last stdout\n");
            prompt.push_str(stdout);
        }
    }
    if let Some(error) = inputs.last_error {
        prompt.push_str("\n\n## Last error\n");
        prompt.push_str(&format!("{}: {}", error.code, error.message));
    }

    prompt.push_str("\n\n## Budget\n");
    prompt.push_str(&format!(
        "turn {} of {}; subcalls used {} of {}; spans used {} of {}",
        inputs.turn_index + 1,
        inputs.budgets.max_turns,
        inputs.consumed.llm_subcalls,
        inputs.budgets.max_llm_subcalls,
        inputs.consumed.spans,
        inputs.budgets.max_spans_total,
    ));

    prompt.push_str("\n\nReply with exactly one ```repl block.\n");
    prompt
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use rlm_protocol::ErrorCode;
    use serde_json::json;

    fn inputs<'a>(state: &'a Value, budgets: &'a BudgetSnapshot, consumed: &'a ConsumedBudget) -> PromptInputs<'a> {
        PromptInputs {
            question: "What is the first word?",
            doc_lens: &[23],
            subcalls_enabled: true,
            output_mode: OutputMode::Answer,
            state,
            last_stdout: None,
            last_error: None,
            budgets,
            consumed,
            turn_index: 0,
        }
    }

    #[test]
    fn prompt_contains_question_corpus_and_budget() {
        let state = json!({"work": {"a": 1}});
        let budgets = BudgetSnapshot::default();
        let consumed = ConsumedBudget::default();
        let prompt = build_root_prompt(&inputs(&state, &budgets, &consumed));
        assert!(prompt.contains("What is the first word?"));
        assert!(prompt.contains("[0] 23"));
        assert!(prompt.contains("turn 1 of 16"));
        assert!(prompt.contains("\"work\""));
        assert!(prompt.contains("queue_llm"));
    }

    #[test]
    fn no_subcalls_variant_swaps_tool_section() {
        let state = json!({});
        let budgets = BudgetSnapshot::default();
        let consumed = ConsumedBudget::default();
        let mut i = inputs(&state, &budgets, &consumed);
        i.subcalls_enabled = false;
        let prompt = build_root_prompt(&i);
        assert!(prompt.contains("Sub-LLM calls are disabled"));
        assert!(!prompt.contains("queue_llm(key"));
    }

    #[test]
    fn contexts_mode_adds_tagging_instructions() {
        let state = json!({});
        let budgets = BudgetSnapshot::default();
        let consumed = ConsumedBudget::default();
        let mut i = inputs(&state, &budgets, &consumed);
        i.output_mode = OutputMode::Contexts;
        let prompt = build_root_prompt(&i);
        assert!(prompt.contains("tag='context'"));
    }

    #[test]
    fn last_error_is_surfaced() {
        let state = json!({});
        let budgets = BudgetSnapshot::default();
        let consumed = ConsumedBudget::default();
        let error = StepError::new(ErrorCode::SandboxAstRejected, "import of `os` is not allowed");
        let mut i = inputs(&state, &budgets, &consumed);
        i.last_error = Some(&error);
        let prompt = build_root_prompt(&i);
        assert!(prompt.contains("SANDBOX_AST_REJECTED"));
    }
}
