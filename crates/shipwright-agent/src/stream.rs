//! Incremental parser for the agent's line-delimited JSON event stream.
//!
//! The scanner buffer (held partial line) is kept separate from the
//! final-text and token accumulators, so a partial or malformed line can
//! never corrupt the authoritative result. Unrecognized event types and
//! lines that fail JSON parse are dropped silently; the stream is
//! best-effort telemetry, not a correctness contract.

use serde_json::Value;

use shipwright_utils::types::TokenUsage;

/// One recognized event from the stream, surfaced for the log tee.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A text content block from an assistant message.
    AssistantText(String),
    /// A tool_use content block from an assistant message.
    ToolUse { name: String, input: Value },
    /// The final result event: authoritative text + cumulative usage.
    Result { text: String, usage: TokenUsage },
}

/// Buffered line scanner plus result accumulators for one invocation.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: String,
    live_text: String,
    result_text: Option<String>,
    usage: TokenUsage,
    dropped_lines: u64,
}

impl StreamParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stdout. Complete lines are parsed immediately; a
    /// trailing partial line is held until the next chunk or [`Self::finish`].
    pub fn push(&mut self, chunk: &str) -> Vec<AgentEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.consume_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    /// Flush the held buffer after EOF. The last line of a stream often
    /// arrives without a trailing newline.
    pub fn finish(&mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.consume_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<AgentEvent>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match parse_event_line(line) {
            Some(parsed) => {
                for event in &parsed {
                    match event {
                        AgentEvent::AssistantText(text) => {
                            if !self.live_text.is_empty() {
                                self.live_text.push('\n');
                            }
                            self.live_text.push_str(text);
                        }
                        AgentEvent::Result { text, usage } => {
                            self.result_text = Some(text.clone());
                            self.usage = *usage;
                        }
                        AgentEvent::ToolUse { .. } => {}
                    }
                }
                events.extend(parsed);
            }
            None => self.dropped_lines += 1,
        }
    }

    /// Authoritative final text: the result event's text when one arrived,
    /// else the live assistant-text accumulation.
    #[must_use]
    pub fn final_text(&self) -> &str {
        self.result_text.as_deref().unwrap_or(&self.live_text)
    }

    /// Cumulative token usage reported by the stream.
    #[must_use]
    pub const fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// Lines dropped as malformed or unrecognized.
    #[must_use]
    pub const fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }
}

/// Parse one complete line into recognized events. Returns `None` for
/// malformed JSON and unknown event types alike.
fn parse_event_line(line: &str) -> Option<Vec<AgentEvent>> {
    let value: Value = serde_json::from_str(line).ok()?;
    match value.get("type").and_then(Value::as_str)? {
        "assistant" => {
            let blocks = value
                .get("message")?
                .get("content")?
                .as_array()?;
            let mut events = Vec::new();
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            events.push(AgentEvent::AssistantText(text.to_string()));
                        }
                    }
                    Some("tool_use") => {
                        let name = block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string();
                        let input = block.get("input").cloned().unwrap_or(Value::Null);
                        events.push(AgentEvent::ToolUse { name, input });
                    }
                    _ => {}
                }
            }
            Some(events)
        }
        "result" => {
            let text = value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let usage = value.get("usage").map_or_else(TokenUsage::default, |u| {
                TokenUsage::new(
                    u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                    u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                )
            });
            Some(vec![AgentEvent::Result { text, usage }])
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant_line(text: &str) -> String {
        json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]}
        })
        .to_string()
    }

    fn result_line(text: &str, input: u64, output: u64) -> String {
        json!({
            "type": "result",
            "result": text,
            "usage": {"input_tokens": input, "output_tokens": output}
        })
        .to_string()
    }

    #[test]
    fn test_assistant_text_accumulates() {
        let mut parser = StreamParser::new();
        parser.push(&format!("{}\n", assistant_line("first")));
        parser.push(&format!("{}\n", assistant_line("second")));
        assert_eq!(parser.final_text(), "first\nsecond");
    }

    #[test]
    fn test_result_event_is_authoritative() {
        let mut parser = StreamParser::new();
        parser.push(&format!("{}\n", assistant_line("live progress")));
        parser.push(&format!("{}\n", result_line("final answer", 120, 45)));
        assert_eq!(parser.final_text(), "final answer");
        assert_eq!(parser.usage(), TokenUsage::new(120, 45));
    }

    #[test]
    fn test_tool_use_block_surfaced_but_not_in_text() {
        let mut parser = StreamParser::new();
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "name": "Bash", "input": {"command": "cargo test"}},
                {"type": "text", "text": "running tests"}
            ]}
        })
        .to_string();
        let events = parser.push(&format!("{line}\n"));
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AgentEvent::ToolUse { ref name, .. } if name == "Bash"));
        assert_eq!(parser.final_text(), "running tests");
    }

    #[test]
    fn test_malformed_and_unknown_lines_dropped_silently() {
        let mut parser = StreamParser::new();
        parser.push("not json at all\n");
        parser.push("{\"type\": \"system\", \"subtype\": \"init\"}\n");
        parser.push("{\"truncated\": \n");
        parser.push(&format!("{}\n", assistant_line("still fine")));
        assert_eq!(parser.final_text(), "still fine");
        assert_eq!(parser.dropped_lines(), 3);
    }

    #[test]
    fn test_partial_line_across_chunks() {
        let mut parser = StreamParser::new();
        let line = assistant_line("split across reads");
        let (head, tail) = line.split_at(line.len() / 2);
        assert!(parser.push(head).is_empty());
        let events = parser.push(&format!("{tail}\n"));
        assert_eq!(events.len(), 1);
        assert_eq!(parser.final_text(), "split across reads");
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut parser = StreamParser::new();
        parser.push(&result_line("no trailing newline", 10, 5));
        assert_eq!(parser.final_text(), "");
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(parser.final_text(), "no trailing newline");
    }

    #[test]
    fn test_partial_line_never_corrupts_result() {
        let mut parser = StreamParser::new();
        parser.push(&format!("{}\n", result_line("good", 1, 2)));
        parser.push("{\"type\": \"result\", \"result\": \"evil");
        // The held partial line must not overwrite the parsed result.
        assert_eq!(parser.final_text(), "good");
        parser.finish();
        assert_eq!(parser.final_text(), "good");
        assert_eq!(parser.dropped_lines(), 1);
    }

    #[test]
    fn test_crlf_lines_handled() {
        let mut parser = StreamParser::new();
        parser.push(&format!("{}\r\n", assistant_line("windows pipe")));
        assert_eq!(parser.final_text(), "windows pipe");
    }
}
