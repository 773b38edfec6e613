use super::types::{ChatMessage, SummaryPayload};

const CLUSTER_SYSTEM_PROMPT: &str = "You are an AI assistant helping a presenter understand audience questions. \
Your task is to analyze a cluster of similar questions and provide: 1) A single representative question that \
captures the common theme, and 2) A brief summary of what the audience is asking about.";

const HOST_SYSTEM_PROMPT: &str = "You are an AI assistant helping a presenter understand audience questions. \
You analyze questions collected during a presentation and answer the presenter's queries about themes, \
topics, and patterns.";

pub fn cluster_messages(questions: &[String]) -> Vec<ChatMessage> {
    let list = questions
        .iter()
        .enumerate()
        .map(|(i, q)| format!("{}. {}", i + 1, q))
        .collect::<Vec<_>>()
        .join("\n");

    let user = format!(
        "Here are {} similar questions from the audience:\n\n{}\n\n\
Please provide:\n\
1. REPRESENTATIVE QUESTION: A single, clear question that represents this cluster\n\
2. SUMMARY: A 1-2 sentence summary of what the audience wants to know\n\n\
Format your response as JSON:\n{{\n  \"representative\": \"...\",\n  \"summary\": \"...\"\n}}",
        questions.len(),
        list
    );

    vec![ChatMessage::system(CLUSTER_SYSTEM_PROMPT), ChatMessage::user(user)]
}

pub fn host_query_messages(query: &str, context: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(HOST_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Context (collected audience questions):\n{}\n\nPresenter's query: {}",
            context, query
        )),
    ]
}

/// Pull the JSON object out of a reply that may be fenced or wrapped in prose
pub fn parse_summary(raw: &str) -> Option<SummaryPayload> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

/// First `max_chars` characters of `text`
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
