use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{debug, info};

/// Interpretation of one line of operator input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Zero-based index into the candidate list
    Device(usize),
    Abort,
    Invalid,
}

/// Parse a menu answer for `count` candidates.
///
/// `1..=count` pick a device, `count + 1` is "None", everything else is invalid.
pub fn parse_selection(input: &str, count: usize) -> Selection {
    match input.trim().parse::<usize>() {
        Ok(n) if n >= 1 && n <= count => Selection::Device(n - 1),
        Ok(n) if n == count + 1 => Selection::Abort,
        _ => Selection::Invalid,
    }
}

pub fn render_menu(ids: &[String]) -> String {
    let mut menu = String::from("Which device would you like to connect to:\n");
    for (index, id) in ids.iter().enumerate() {
        menu.push_str(&format!("{}. {}\n", index + 1, id));
    }
    menu.push_str(&format!("{}. None\n", ids.len() + 1));
    menu
}

/// Source of operator answers
#[async_trait]
pub trait SelectionInput: Send {
    /// Next line of input, or `None` at end of input
    async fn read_line(&mut self) -> Result<Option<String>>;

    /// Show text to the operator
    async fn present(&mut self, text: &str) -> Result<()>;
}

/// Menu-driven choice among discovered devices
pub struct DeviceSelector<I> {
    input: I,
}

impl<I: SelectionInput> DeviceSelector<I> {
    pub fn new(input: I) -> Self {
        Self { input }
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    /// Ask until the answer is a device or "None".
    ///
    /// Returns the zero-based index of the chosen device, or `None` to abort.
    /// Running out of input also aborts.
    pub async fn select(&mut self, ids: &[String]) -> Result<Option<usize>> {
        let menu = render_menu(ids);

        loop {
            self.input.present(&menu).await?;

            let line = match self.input.read_line().await? {
                Some(line) => line,
                None => {
                    info!("Input closed before a device was selected");
                    return Ok(None);
                }
            };

            match parse_selection(&line, ids.len()) {
                Selection::Device(index) => {
                    debug!("Operator selected {}", ids[index]);
                    return Ok(Some(index));
                }
                Selection::Abort => return Ok(None),
                Selection::Invalid => {
                    debug!("Rejected selection {:?}", line.trim());
                    self.input.present("Invalid selection\n").await?;
                }
            }
        }
    }
}

/// Interactive input from the terminal
pub struct ConsoleInput {
    lines: Lines<BufReader<Stdin>>,
}

impl ConsoleInput {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for ConsoleInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SelectionInput for ConsoleInput {
    async fn read_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.next_line().await?)
    }

    async fn present(&mut self, text: &str) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Pre-recorded answers, for non-interactive runs
#[derive(Debug, Default)]
pub struct ScriptedInput {
    answers: VecDeque<String>,
    transcript: Vec<String>,
}

impl ScriptedInput {
    pub fn new<S: Into<String>>(answers: impl IntoIterator<Item = S>) -> Self {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            transcript: Vec::new(),
        }
    }

    /// Everything that was presented, in order
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }
}

#[async_trait]
impl SelectionInput for ScriptedInput {
    async fn read_line(&mut self) -> Result<Option<String>> {
        Ok(self.answers.pop_front())
    }

    async fn present(&mut self, text: &str) -> Result<()> {
        info!("{}", text.trim_end());
        self.transcript.push(text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Vec<String> {
        vec!["LM-1".to_string(), "LM-2".to_string(), "LM-3".to_string()]
    }

    #[test]
    fn test_parse_selection_boundaries() {
        assert_eq!(parse_selection("1", 3), Selection::Device(0));
        assert_eq!(parse_selection(" 3\n", 3), Selection::Device(2));
        assert_eq!(parse_selection("4", 3), Selection::Abort);
        assert_eq!(parse_selection("0", 3), Selection::Invalid);
        assert_eq!(parse_selection("5", 3), Selection::Invalid);
        assert_eq!(parse_selection("two", 3), Selection::Invalid);
        assert_eq!(parse_selection("", 3), Selection::Invalid);
        assert_eq!(parse_selection("-1", 3), Selection::Invalid);
    }

    #[test]
    fn test_render_menu_appends_none() {
        assert_eq!(
            render_menu(&ids()),
            "Which device would you like to connect to:\n1. LM-1\n2. LM-2\n3. LM-3\n4. None\n"
        );
    }

    #[tokio::test]
    async fn test_selector_picks_device() {
        let mut selector = DeviceSelector::new(ScriptedInput::new(["2"]));
        assert_eq!(selector.select(&ids()).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_selector_reprompts_on_invalid_input() {
        let mut selector = DeviceSelector::new(ScriptedInput::new(["9", "abc", "12", "3"]));

        assert_eq!(selector.select(&ids()).await.unwrap(), Some(2));

        let transcript = selector.input().transcript();
        let rejections = transcript
            .iter()
            .filter(|t| t.as_str() == "Invalid selection\n")
            .count();
        assert_eq!(rejections, 3);
    }

    #[tokio::test]
    async fn test_selector_none_and_end_of_input_abort() {
        let mut selector = DeviceSelector::new(ScriptedInput::new(["4"]));
        assert_eq!(selector.select(&ids()).await.unwrap(), None);

        let mut selector = DeviceSelector::new(ScriptedInput::new(["0"]));
        assert_eq!(selector.select(&ids()).await.unwrap(), None);
    }
}
