//! Title stage: parse a filename into a `TitleInfo`.

use std::sync::Arc;

use async_trait::async_trait;
use regex_lite::Regex;
use tracing::debug;

use crate::queue::{Item, Queue, TitleInfo, Trouble};
use crate::workers::{StageTask, WorkerKey};

/// Matches either an episodic `SxxEyy` pair (with the leading title) or a
/// four-digit release year.
const TITLE_PATTERN: &str = r"([\w.]+)(([SsEe]\d+){2})|(20|19)\d{2}";

/// Parse a source file name into a title.
///
/// The extension is stripped first. An `SxxEyy` pair makes the item
/// episodic with the captured season/episode numbers; otherwise a
/// four-digit year tags it as a movie. Trailing separator dots on the
/// captured title are trimmed.
pub fn parse_title(file_name: &str) -> Option<TitleInfo> {
    let stem = match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    };

    let pattern = Regex::new(TITLE_PATTERN).ok()?;
    let captures = pattern.captures(stem)?;

    if let (Some(title), Some(pair)) = (captures.get(1), captures.get(2)) {
        let episode_pattern = Regex::new(r"[SsEe](\d+)[SsEe](\d+)").ok()?;
        let numbers = episode_pattern.captures(pair.as_str())?;
        let season: u32 = numbers.get(1)?.as_str().parse().ok()?;
        let episode: u32 = numbers.get(2)?.as_str().parse().ok()?;
        return Some(TitleInfo::Episode {
            title: title.as_str().trim_matches('.').to_string(),
            season,
            episode,
        });
    }

    // Year alternative: the whole match is the year, the title is
    // everything before it.
    let matched = captures.get(0)?;
    let year: u32 = matched.as_str().parse().ok()?;
    let title = stem[..matched.start()]
        .trim_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string();
    Some(TitleInfo::Movie { title, year })
}

/// Worker task for the title stage.
pub struct TitleTask {
    queue: Arc<Queue>,
}

impl TitleTask {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl StageTask for TitleTask {
    fn key(&self) -> WorkerKey {
        WorkerKey::TitleParser
    }

    async fn run(&self, item: &Item) -> Result<(), Trouble> {
        let info = parse_title(&item.name).ok_or(Trouble::UnparsableTitle)?;
        debug!(item = %item.id, title = %info.title(), episodic = info.is_episodic(), "parsed title");
        let _ = self.queue.set_title(item.id, info);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episodic_parse() {
        let info = parse_title("Breaking.Bad.S02E07.720p.mkv").unwrap();
        assert_eq!(
            info,
            TitleInfo::Episode {
                title: "Breaking.Bad".into(),
                season: 2,
                episode: 7,
            }
        );
    }

    #[test]
    fn test_movie_parse() {
        let info = parse_title("Inception.2010.1080p.mkv").unwrap();
        assert_eq!(
            info,
            TitleInfo::Movie {
                title: "Inception".into(),
                year: 2010,
            }
        );
    }

    #[test]
    fn test_unparsable_name() {
        assert_eq!(parse_title("random_noise.mkv"), None);
    }

    #[test]
    fn test_lowercase_episode_markers() {
        let info = parse_title("some.show.s01e02.mkv").unwrap();
        assert_eq!(
            info,
            TitleInfo::Episode {
                title: "some.show".into(),
                season: 1,
                episode: 2,
            }
        );
    }

    #[test]
    fn test_nineteen_hundreds_year() {
        let info = parse_title("The.Matrix.1999.mkv").unwrap();
        assert_eq!(
            info,
            TitleInfo::Movie {
                title: "The.Matrix".into(),
                year: 1999,
            }
        );
    }

    #[test]
    fn test_episodic_takes_precedence_over_year() {
        // A name carrying both an SxxEyy pair and a year parses episodic.
        let info = parse_title("Show.2020.S01E01.mkv").unwrap();
        assert!(info.is_episodic());
    }

    #[test]
    fn test_multi_digit_season_episode() {
        let info = parse_title("Long.Runner.S12E345.mkv").unwrap();
        assert_eq!(info.season(), Some(12));
        assert_eq!(info.episode(), Some(345));
    }
}
