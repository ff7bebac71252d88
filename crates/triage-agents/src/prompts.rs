//! Prompt constants for the merger and the generator.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever prompt content changes.
//! The version is recorded in audit details so a regression in model output
//! can be traced to the prompt that produced it.

use triage::{ThreadState, WorkItemType};

/// Prompt version. Bump on any prompt content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Sent as a user turn after a reply that could not be parsed.
pub const CORRECTIVE_INSTRUCTION: &str = "\
Your previous reply could not be parsed as the requested JSON. \
Respond with ONLY valid JSON matching the requested shape. \
No markdown fences, no comments, no prose before or after the object.";

/// ThreadState merger system prompt.
///
/// The merge must be cumulative and lossless: the model receives the current
/// state and one new message and returns the complete next state.
pub const MERGER_SYSTEM_PROMPT: &str = "\
You maintain a structured understanding of a customer feedback conversation.

You receive the CURRENT thread state as JSON and ONE new message. Return the \
COMPLETE updated thread state as a single JSON object.

## Merge rules
- Merging is cumulative and lossless. Never drop facts, repro steps, \
  environment details or candidates that are already in the current state.
- `summary` must never get shorter in information content. Rewrite it to \
  include the new message.
- Move questions the new message answers from `openQuestions` to \
  `resolvedQuestions`. Never list a question in both.
- Append new reproduction steps to `reproSteps` in order.
- If the new message raises a topic unrelated to the current one, set \
  `recommendation.action` to `SplitIntoTwo` and add a candidate for each topic.
- `confidence` values are numbers between 0 and 1.

## Recommendation actions
- `NoTicket`: chit-chat, thanks, questions answered from documentation.
- `AskQuestions`: a real problem, but key details are missing.
- `CreateBugWorkItem`: broken behavior with enough detail to act on.
- `CreateFeatureWorkItem`: a concrete request for new behavior.
- `SplitIntoTwo`: the conversation now covers two unrelated issues.

## Output shape
{
  \"summary\": string,
  \"userGoal\": string | null,
  \"intent\": \"Bug\" | \"Feature\" | \"Performance\" | \"Billing\" | \"Other\",
  \"knownEnvironment\": { [key: string]: string },
  \"reproSteps\": string[],
  \"expectedBehavior\": string | null,
  \"actualBehavior\": string | null,
  \"openQuestions\": string[],
  \"resolvedQuestions\": string[],
  \"signals\": { [key: string]: string | number | boolean },
  \"workItemCandidates\": [{ \"type\": string, \"shortTitle\": string, \"reason\": string, \"confidence\": number }],
  \"recommendation\": { \"action\": string, \"reason\": string, \"confidence\": number },
  \"duplicateHint\": { \"possibleDuplicate\": boolean, \"matchedWorkItemId\": string | null, \"matchedTicketUrl\": string | null }
}

Respond with ONLY the JSON object.";

/// Work item generator system prompt, with a worked example.
pub const GENERATOR_SYSTEM_PROMPT: &str = "\
You turn a structured summary of a customer conversation into one engineering \
work item that a developer or coding agent can pick up without reading the \
conversation.

## Output shape
{
  \"title\": string,
  \"type\": \"Bug\" | \"Feature\" | \"Chore\" | \"Docs\",
  \"structuredDescription\": string (markdown),
  \"acceptanceCriteria\": string[],
  \"priority\": \"P0\" | \"P1\" | \"P2\" | \"P3\",
  \"severity\": integer 1-5,
  \"riskLevel\": \"Low\" | \"Medium\" | \"High\",
  \"estimatedEffort\": { \"tShirt\": \"XS\" | \"S\" | \"M\" | \"L\" | \"XL\", \"hoursMin\": number, \"hoursMax\": number, \"confidence\": number },
  \"promptBundle\": { \"agentPrompt\": string, \"verificationPrompt\": string, \"suspectedFiles\": string[], \"suspectedTests\": string[], \"suggestedCommands\": string[] },
  \"labels\": string[]
}

## Example
{
  \"title\": \"Login crashes on Safari 17 after password entry\",
  \"type\": \"Bug\",
  \"structuredDescription\": \"## Problem\\nSubmitting the login form on Safari 17 crashes the tab.\\n\\n## Environment\\nSafari 17, macOS 14\",
  \"acceptanceCriteria\": [\"Login succeeds on Safari 17\", \"Regression test covers the password submit path\"],
  \"priority\": \"P1\",
  \"severity\": 4,
  \"riskLevel\": \"Medium\",
  \"estimatedEffort\": { \"tShirt\": \"S\", \"hoursMin\": 2, \"hoursMax\": 6, \"confidence\": 0.6 },
  \"promptBundle\": {
    \"agentPrompt\": \"Reproduce the Safari 17 login crash and fix the password submit handler.\",
    \"verificationPrompt\": \"Confirm login works on Safari 17 and the new test passes.\",
    \"suspectedFiles\": [\"src/auth/login_form.ts\"],
    \"suspectedTests\": [\"tests/auth/login.spec.ts\"],
    \"suggestedCommands\": [\"npm test -- login\"]
  },
  \"labels\": [\"auth\", \"safari\"]
}

Respond with ONLY the JSON object.";

/// User turn for the merger: current state plus the new message.
pub fn merger_user_prompt(current: &ThreadState, message: &str, metadata: &str) -> String {
    let state = serde_json::to_string_pretty(current).unwrap_or_else(|_| "{}".to_string());
    let mut prompt = format!("## Current thread state\n{state}\n\n## New message\n{message}\n");
    if !metadata.trim().is_empty() {
        prompt.push_str(&format!("\n## Message metadata\n{metadata}\n"));
    }
    prompt
}

/// User turn for the generator.
pub fn generator_user_prompt(state: &ThreadState, item_type: WorkItemType) -> String {
    let state = serde_json::to_string_pretty(state).unwrap_or_else(|_| "{}".to_string());
    format!("Create a {item_type} work item from this thread state.\n\n## Thread state\n{state}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merger_prompt_carries_state_and_message() {
        let prompt = merger_user_prompt(&ThreadState::empty(), "It crashes", "");
        assert!(prompt.contains("\"recommendation\""));
        assert!(prompt.contains("It crashes"));
        assert!(!prompt.contains("metadata"));

        let prompt = merger_user_prompt(&ThreadState::empty(), "x", "channel: slack");
        assert!(prompt.contains("channel: slack"));
    }

    #[test]
    fn generator_prompt_names_type() {
        let prompt = generator_user_prompt(&ThreadState::empty(), WorkItemType::Bug);
        assert!(prompt.starts_with("Create a Bug work item"));
    }
}
