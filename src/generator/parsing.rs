//! Prompt construction and response parsing for the generator calls
//! made by the Sync Worker (§4.H steps 4 and 7).
//!
//! JSON parsing follows §9's Open Question resolution: a real JSON
//! parser (`serde_json`) is mandatory; a brace-counting pre-scan
//! (`find('{')` / `rfind('}')`) is only a recovery aid for responses
//! wrapped in prose or markdown fences, grounded on
//! `ai::utils::{clean_dsl_response, parse_structured_response}` in the
//! teacher repo. When no JSON survives either pass, the heuristic text
//! fallback parser (`parse_numbered_or_bulleted`) extracts candidate
//! titles, tagging every result `from_fallback_parser: true` so the
//! Reconciler's metrics can exclude them (§9 design note) — the
//! Reconciler itself treats them like any other proposal.

use serde::Deserialize;

use crate::models::{ProposedStory, Root, TestCase, TestPriority, TestType};

// ---------------------------------------------------------------------------
// Story extraction prompts
// ---------------------------------------------------------------------------

pub fn story_system_prompt(compact: bool) -> String {
    if compact {
        r#"You convert Epics into user stories. Respond ONLY with compact JSON:
{"s":[{"h":"heading","d":"description","ac":["criterion"],"p":"priority","pts":3}]}
Abbreviations: h=heading, d=description, ac=acceptance_criteria, p=priority, pts=story_points."#
            .to_string()
    } else {
        r#"You are an expert business analyst. Convert the given Epic into a set of
well-formed user stories. Respond ONLY with valid JSON:
{"stories":[{"heading":"...","description":"...","acceptance_criteria":["..."],
"priority":"...","story_points":3,"technical_context":"...","business_requirements":"..."}]}"#
            .to_string()
    }
}

pub fn story_user_prompt(root: &Root, compact: bool) -> String {
    if compact {
        format!("Epic: {}\nDesc: {}", root.title, root.description)
    } else {
        format!(
            "EPIC TITLE: {}\n\nEPIC DESCRIPTION:\n{}\n\nGenerate user stories that fully cover this Epic.",
            root.title, root.description
        )
    }
}

// ---------------------------------------------------------------------------
// Test case extraction prompts
// ---------------------------------------------------------------------------

pub fn test_case_system_prompt(compact: bool) -> String {
    if compact {
        r#"You are a QA engineer. Generate test cases as compact JSON:
{"tcs":[{"t":"title","desc":"description","type":"pos|neg|edge|sec|perf|integ",
"prio":"Crit|High|Med|Low","steps":["1.step"],"exp":"expected result","prereq":"setup"}]}"#
            .to_string()
    } else {
        r#"You are a senior QA engineer. Generate comprehensive test cases. Respond ONLY
with valid JSON:
{"test_cases":[{"title":"...","description":"...",
"test_type":"positive|negative|edge_case|security|performance|integration",
"priority":"Critical|High|Medium|Low","steps":["..."],"expected_result":"...",
"prerequisites":"..."}]}"#
            .to_string()
    }
}

pub fn test_case_user_prompt(story: &ProposedStory, compact: bool) -> String {
    if compact {
        format!("Story: {}\nDesc: {}", story.heading, story.description)
    } else {
        format!(
            "USER STORY: {}\n\nDESCRIPTION:\n{}\n\nACCEPTANCE CRITERIA:\n{}\n\nGenerate test cases covering happy path, negative, edge, and security scenarios.",
            story.heading,
            story.description,
            story.acceptance_criteria.join("\n")
        )
    }
}

// ---------------------------------------------------------------------------
// Response cleanup + brace pre-scan
// ---------------------------------------------------------------------------

/// Strips a leading/trailing markdown code fence, if present.
fn strip_markdown_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

/// Real-parser-first JSON recovery: try the cleaned text directly, then
/// fall back to the substring between the first `{` and the last `}`.
fn recover_json(raw: &str) -> Option<serde_json::Value> {
    let cleaned = strip_markdown_fence(raw);
    if let Ok(value) = serde_json::from_str(&cleaned) {
        return Some(value);
    }
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&cleaned[start..=end]).ok()
}

// ---------------------------------------------------------------------------
// Story response parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StandardStory {
    heading: String,
    description: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    story_points: Option<f64>,
    #[serde(default)]
    technical_context: Option<String>,
    #[serde(default)]
    business_requirements: Option<String>,
}

#[derive(Deserialize)]
struct StandardStoryEnvelope {
    stories: Vec<StandardStory>,
}

#[derive(Deserialize)]
struct CompactStory {
    h: String,
    d: String,
    #[serde(default)]
    ac: Vec<String>,
    #[serde(default)]
    p: Option<String>,
    #[serde(default)]
    pts: Option<f64>,
}

#[derive(Deserialize)]
struct CompactStoryEnvelope {
    s: Vec<CompactStory>,
}

/// Parses a generator response into proposed stories. Returns `true` in
/// the second element when the heuristic fallback parser had to be used
/// (§4.H step 4).
pub fn parse_proposed_stories(response: &str) -> (Vec<ProposedStory>, bool) {
    if let Some(value) = recover_json(response) {
        if let Ok(envelope) = serde_json::from_value::<StandardStoryEnvelope>(value.clone()) {
            return (
                envelope
                    .stories
                    .into_iter()
                    .map(|s| ProposedStory {
                        heading: s.heading,
                        description: s.description,
                        acceptance_criteria: s.acceptance_criteria,
                        priority: s.priority,
                        story_points: s.story_points,
                        technical_context: s.technical_context,
                        business_requirements: s.business_requirements,
                        from_fallback_parser: false,
                    })
                    .collect(),
                false,
            );
        }
        if let Ok(envelope) = serde_json::from_value::<CompactStoryEnvelope>(value) {
            return (
                envelope
                    .s
                    .into_iter()
                    .map(|s| ProposedStory {
                        heading: s.h,
                        description: s.d,
                        acceptance_criteria: s.ac,
                        priority: s.p,
                        story_points: s.pts,
                        technical_context: None,
                        business_requirements: None,
                        from_fallback_parser: false,
                    })
                    .collect(),
                false,
            );
        }
    }

    let fallback = parse_numbered_or_bulleted(response);
    if fallback.is_empty() {
        (vec![placeholder_story()], true)
    } else {
        (fallback, true)
    }
}

fn placeholder_story() -> ProposedStory {
    ProposedStory {
        heading: "Manual Validation Required".to_string(),
        description: "The generator response could not be parsed automatically; a human should review the Epic and author stories manually.".to_string(),
        acceptance_criteria: Vec::new(),
        priority: None,
        story_points: None,
        technical_context: None,
        business_requirements: None,
        from_fallback_parser: true,
    }
}

/// Extracts candidate story titles from numbered (`1.`, `1)`) or
/// bulleted (`-`, `*`) lines when no JSON survives.
fn parse_numbered_or_bulleted(text: &str) -> Vec<ProposedStory> {
    let list_marker = regex::Regex::new(r"^\s*(?:\d+[.)]|[-*])\s+(.+)$").unwrap();

    text.lines()
        .filter_map(|line| {
            list_marker
                .captures(line)
                .map(|caps| caps[1].trim().to_string())
        })
        .filter(|heading| !heading.is_empty())
        .map(|heading| ProposedStory {
            heading,
            description: String::new(),
            acceptance_criteria: Vec::new(),
            priority: None,
            story_points: None,
            technical_context: None,
            business_requirements: None,
            from_fallback_parser: true,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Test case response parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StandardTestCase {
    title: String,
    description: String,
    test_type: String,
    priority: String,
    #[serde(default)]
    steps: Vec<String>,
    expected_result: String,
    #[serde(default)]
    prerequisites: Option<String>,
}

#[derive(Deserialize)]
struct StandardTestCaseEnvelope {
    test_cases: Vec<StandardTestCase>,
}

#[derive(Deserialize)]
struct CompactTestCase {
    t: String,
    desc: String,
    #[serde(rename = "type")]
    type_abbrev: String,
    prio: String,
    #[serde(default)]
    steps: Vec<String>,
    exp: String,
    #[serde(default)]
    prereq: Option<String>,
}

#[derive(Deserialize)]
struct CompactTestCaseEnvelope {
    tcs: Vec<CompactTestCase>,
}

fn parse_test_type(raw: &str) -> TestType {
    match raw {
        "positive" | "pos" => TestType::Positive,
        "negative" | "neg" => TestType::Negative,
        "edge_case" | "edge" => TestType::EdgeCase,
        "security" | "sec" => TestType::Security,
        "performance" | "perf" => TestType::Performance,
        "integration" | "integ" => TestType::Integration,
        _ => TestType::Positive,
    }
}

fn parse_priority(raw: &str) -> TestPriority {
    match raw {
        "Critical" | "Crit" => TestPriority::Critical,
        "High" => TestPriority::High,
        "Low" => TestPriority::Low,
        _ => TestPriority::Medium,
    }
}

fn fallback_test_case() -> TestCase {
    TestCase {
        title: "Verify Story Meets Acceptance Criteria".to_string(),
        description: "Generic coverage generated after the generator response could not be parsed.".to_string(),
        test_type: TestType::Positive,
        priority: TestPriority::Medium,
        preconditions: vec!["Story is well-defined".to_string()],
        test_steps: vec!["Review the user story".to_string(), "Exercise each acceptance criterion".to_string()],
        expected_result: "All acceptance criteria are satisfied.".to_string(),
    }
}

/// Parses a test case generator response, accepting both the compact
/// `{"tcs": [...]}` and standard `{"test_cases": [...]}` envelopes
/// (§4.H step 7). Falls back to one generic test case if parsing fails.
pub fn parse_test_cases(response: &str) -> Vec<TestCase> {
    let Some(value) = recover_json(response) else {
        return vec![fallback_test_case()];
    };

    if let Ok(envelope) = serde_json::from_value::<StandardTestCaseEnvelope>(value.clone()) {
        return envelope
            .test_cases
            .into_iter()
            .map(|tc| TestCase {
                title: tc.title,
                description: tc.description,
                test_type: parse_test_type(&tc.test_type),
                priority: parse_priority(&tc.priority),
                preconditions: tc.prerequisites.map(|p| vec![p]).unwrap_or_default(),
                test_steps: tc.steps,
                expected_result: tc.expected_result,
            })
            .collect();
    }

    if let Ok(envelope) = serde_json::from_value::<CompactTestCaseEnvelope>(value) {
        return envelope
            .tcs
            .into_iter()
            .map(|tc| TestCase {
                title: tc.t,
                description: tc.desc,
                test_type: parse_test_type(&tc.type_abbrev),
                priority: parse_priority(&tc.prio),
                preconditions: tc.prereq.map(|p| vec![p]).unwrap_or_default(),
                test_steps: tc.steps,
                expected_result: tc.exp,
            })
            .collect();
    }

    vec![fallback_test_case()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_story_envelope() {
        let response = r#"{"stories":[{"heading":"User signs up","description":"desc","acceptance_criteria":["a","b"]}]}"#;
        let (stories, used_fallback) = parse_proposed_stories(response);
        assert!(!used_fallback);
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].heading, "User signs up");
    }

    #[test]
    fn parses_story_wrapped_in_markdown_fence() {
        let response = "```json\n{\"stories\":[{\"heading\":\"X\",\"description\":\"Y\"}]}\n```";
        let (stories, used_fallback) = parse_proposed_stories(response);
        assert!(!used_fallback);
        assert_eq!(stories[0].heading, "X");
    }

    #[test]
    fn parses_story_with_prose_around_json() {
        let response = "Sure, here are the stories:\n{\"stories\":[{\"heading\":\"X\",\"description\":\"Y\"}]}\nLet me know if you need more.";
        let (stories, used_fallback) = parse_proposed_stories(response);
        assert!(!used_fallback);
        assert_eq!(stories.len(), 1);
    }

    #[test]
    fn parses_compact_story_envelope() {
        let response = r#"{"s":[{"h":"Heading","d":"Desc","ac":["a"],"p":"High","pts":3}]}"#;
        let (stories, used_fallback) = parse_proposed_stories(response);
        assert!(!used_fallback);
        assert_eq!(stories[0].heading, "Heading");
        assert_eq!(stories[0].priority.as_deref(), Some("High"));
    }

    #[test]
    fn s5_garbage_response_falls_back_to_numbered_list() {
        let response = "not json\n1. First candidate story\n2. Second candidate story\nsome trailing prose";
        let (stories, used_fallback) = parse_proposed_stories(response);
        assert!(used_fallback);
        assert_eq!(stories.len(), 2);
        assert_eq!(stories[0].heading, "First candidate story");
        assert!(stories.iter().all(|s| s.from_fallback_parser));
    }

    #[test]
    fn s5_garbage_with_no_candidates_emits_placeholder() {
        let (stories, used_fallback) = parse_proposed_stories("not json, no structure at all");
        assert!(used_fallback);
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].heading, "Manual Validation Required");
    }

    #[test]
    fn parses_standard_test_case_envelope() {
        let response = r#"{"test_cases":[{"title":"Verify X","description":"d","test_type":"positive","priority":"High","steps":["s1"],"expected_result":"works","prerequisites":"none"}]}"#;
        let tcs = parse_test_cases(response);
        assert_eq!(tcs.len(), 1);
        assert_eq!(tcs[0].test_type, TestType::Positive);
        assert_eq!(tcs[0].priority, TestPriority::High);
    }

    #[test]
    fn parses_compact_test_case_envelope() {
        let response = r#"{"tcs":[{"t":"Verify X","desc":"d","type":"neg","prio":"Crit","steps":["s1"],"exp":"works","prereq":"none"}]}"#;
        let tcs = parse_test_cases(response);
        assert_eq!(tcs.len(), 1);
        assert_eq!(tcs[0].test_type, TestType::Negative);
        assert_eq!(tcs[0].priority, TestPriority::Critical);
    }

    #[test]
    fn unparseable_test_case_response_falls_back_to_generic() {
        let tcs = parse_test_cases("garbage, not structured at all");
        assert_eq!(tcs.len(), 1);
        assert_eq!(tcs[0].title, "Verify Story Meets Acceptance Criteria");
    }
}
