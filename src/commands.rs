/// Builds the textual commands sent through the worker-command channel. Two
/// forms exist: `/silent-command <lua-expr>` and `/sc <function>(<args>)`.
/// Nothing is executed here; callers compose Lua-table-like literals from
/// `add`/`add_quoted`.
pub struct CommandBuilder {
    buffer: String,
    closing: &'static str,
}

impl CommandBuilder {
    pub fn silent_command() -> Self {
        Self {
            buffer: "/silent-command ".to_string(),
            closing: "",
        }
    }

    pub fn server_command(function: &str) -> Self {
        Self {
            buffer: format!("/sc {}(", function),
            closing: ")",
        }
    }

    pub fn add(mut self, text: &str) -> Self {
        self.buffer.push_str(text);
        self
    }

    /// Appends a double-quoted Lua string, escaping backslashes and embedded
    /// quotes.
    pub fn add_quoted(mut self, text: &str) -> Self {
        self.buffer.push('"');
        for c in text.chars() {
            match c {
                '\\' => self.buffer.push_str("\\\\"),
                '"' => self.buffer.push_str("\\\""),
                _ => self.buffer.push(c),
            }
        }
        self.buffer.push('"');
        self
    }

    pub fn remove_last(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.buffer.pop();
        }
        self
    }

    pub fn build(mut self) -> String {
        self.buffer.push_str(self.closing);
        self.buffer
    }
}
