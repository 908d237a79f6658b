pub const GET_SITE_DATA_DESCRIPTION: &str = "Fetch the extracted lease data for a site. \
Values that come from a source document carry a citation token in their `document` field, \
for example `CITESITE1-C`. Call this before answering any question about a site.";

/// Appended to every configuration's system prompt.
pub const ANSWER_FORMAT: &str = r#"### Answer format
Call `get_site_data` for the site the user asks about before answering. Use only the data it returns.

Reply with a single JSON object and nothing else:
{"response": "<answer text>", "citations": ["<token>", ...]}

- Mark each cited fact in `response` with an inline number, e.g. "The rent is $18,658.83[1]."
- `citations` lists the `document` tokens you relied on, in the order of their inline numbers.
- Copy tokens exactly as they appear, e.g. "CITESITE1-C". Never invent a token.
- If the data does not answer the question, say so and return an empty `citations` list."#;

/// System prompt for a site question: the configuration's prompt plus the answer format.
pub fn site_system_prompt(config_prompt: &str) -> String {
    format!("{}\n\n{}", config_prompt.trim_end(), ANSWER_FORMAT)
}
