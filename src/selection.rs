//! Choosing objects and PSF candidates by index
use std::io::{self, BufRead, Write};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;

/// Supplies the indices chosen from a list of candidates
pub trait IndexSelector {
    /// `candidates` holds one human-readable line per candidate
    fn select(&mut self, prompt: &str, candidates: &[String]) -> Result<Vec<usize>>;
}

/// Every run of digits in `text` becomes one index; everything else separates.
pub fn parse_indices(text: &str) -> Vec<usize> {
    static DIGITS: OnceLock<Option<Regex>> = OnceLock::new();
    match DIGITS.get_or_init(|| Regex::new(r"\d+").ok()) {
        Some(re) => re
            .find_iter(text)
            .filter_map(|m| m.as_str().parse().ok())
            .collect(),
        None => Vec::new(),
    }
}

/// Prompts on a writer and reads one line of indices from a reader
pub struct ConsoleSelector<R, W> {
    input: R,
    output: W,
}

impl ConsoleSelector<io::BufReader<io::Stdin>, io::Stdout> {
    pub fn stdio() -> Self {
        Self {
            input: io::BufReader::new(io::stdin()),
            output: io::stdout(),
        }
    }
}

impl<R: BufRead, W: Write> ConsoleSelector<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> IndexSelector for ConsoleSelector<R, W> {
    fn select(&mut self, prompt: &str, candidates: &[String]) -> Result<Vec<usize>> {
        for (i, line) in candidates.iter().enumerate() {
            writeln!(self.output, "  [{}] {}", i, line)?;
        }
        writeln!(self.output, "{}", prompt)?;
        self.output.flush()?;

        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(parse_indices(&line))
    }
}

/// Never selects anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSelection;

impl IndexSelector for NoSelection {
    fn select(&mut self, _prompt: &str, _candidates: &[String]) -> Result<Vec<usize>> {
        Ok(Vec::new())
    }
}

/// Returns a preset list of indices
#[derive(Debug, Default, Clone)]
pub struct FixedSelection(pub Vec<usize>);

impl IndexSelector for FixedSelection {
    fn select(&mut self, _prompt: &str, _candidates: &[String]) -> Result<Vec<usize>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_indices() {
        assert_eq!(parse_indices("1 12,3"), vec![1, 12, 3]);
        assert_eq!(parse_indices("  0\n"), vec![0]);
        assert_eq!(parse_indices("none"), Vec::<usize>::new());
        assert_eq!(parse_indices("-2 x4"), vec![2, 4]);
    }

    #[test]
    fn test_console_selector_reads_line() {
        let input = io::Cursor::new(b"0 2\n".to_vec());
        let mut output = Vec::new();
        let mut selector = ConsoleSelector::new(input, &mut output);

        let picked = selector
            .select("Pick objects:", &["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(picked, vec![0, 2]);

        let shown = String::from_utf8(output).unwrap();
        assert!(shown.contains("[1] b"));
        assert!(shown.contains("Pick objects:"));
    }

    #[test]
    fn test_console_selector_eof_selects_nothing() {
        let mut selector = ConsoleSelector::new(io::Cursor::new(Vec::new()), io::sink());
        assert!(selector.select("?", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_fixed_and_none() {
        assert_eq!(FixedSelection(vec![3]).select("", &[]).unwrap(), vec![3]);
        assert!(NoSelection.select("", &[]).unwrap().is_empty());
    }
}
