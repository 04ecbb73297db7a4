use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::AppError;
use crate::models::{Achievement, AchievementDetails, AchievementStub, EarnedResponse, Game};
use crate::source::Throttled;

pub const WEB_BASE: &str = "https://www.exophase.com/";
pub const API_BASE: &str = "https://api.exophase.com/";
pub const DEFAULT_PLATFORM: &str = "psn";

static HOURS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d[\d,]*)\s*h").expect("hours pattern"));
static MINUTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d[\d,]*)\s*m").expect("minutes pattern"));

/// URL templates for the site and its public player API.
#[derive(Debug, Clone)]
pub struct Endpoints {
    web: Url,
    api: Url,
    platform: String,
}

impl Endpoints {
    pub fn new(web_base: &str, api_base: &str, platform: &str) -> Result<Self, AppError> {
        Ok(Self {
            web: Url::parse(web_base)?,
            api: Url::parse(api_base)?,
            platform: platform.to_string(),
        })
    }

    pub fn profile_url(&self, handle: &str) -> Result<Url, AppError> {
        with_segments(&self.web, &["user", handle])
    }

    /// Listing pages are keyed by the platform username, not the resolved user id.
    pub fn listing_url(&self, username: &str) -> Result<Url, AppError> {
        with_segments(&self.web, &[self.platform.as_str(), "user", username])
    }

    pub fn earned_url(&self, fragment: &str, game_id: &str) -> Result<Url, AppError> {
        with_segments(
            &self.api,
            &["public", "player", fragment, "game", game_id, "earned"],
        )
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            web: Url::parse(WEB_BASE).expect("static web base"),
            api: Url::parse(API_BASE).expect("static api base"),
            platform: DEFAULT_PLATFORM.to_string(),
        }
    }
}

fn with_segments(base: &Url, segments: &[&str]) -> Result<Url, AppError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| AppError::InvalidArgument(format!("'{base}' cannot be used as a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub async fn resolve_profile(
    source: &Throttled,
    endpoints: &Endpoints,
    handle: &str,
) -> Result<String, AppError> {
    let url = endpoints.profile_url(handle)?;
    info!(%url, "resolving profile");
    let html = source.fetch_text(&url).await?;
    let user_id = parse_user_id(&html)?;
    info!(user_id = %user_id, "profile resolved");
    Ok(user_id)
}

pub async fn fetch_games(
    source: &Throttled,
    endpoints: &Endpoints,
    username: &str,
) -> Result<Vec<Game>, AppError> {
    let url = endpoints.listing_url(username)?;
    info!(%url, "fetching game list");
    let html = source.fetch_text(&url).await?;
    let games = parse_games(&html, &url)?;
    info!(count = games.len(), "game list parsed");
    Ok(games)
}

/// Returns `None` when the game URL carries no player fragment.
pub async fn fetch_earned(
    source: &Throttled,
    endpoints: &Endpoints,
    game: &Game,
) -> Result<Option<Vec<AchievementStub>>, AppError> {
    let Some(fragment) = url_fragment(&game.url) else {
        debug!(game_id = %game.id, url = %game.url, "no player fragment, skipping");
        return Ok(None);
    };

    let url = endpoints.earned_url(&fragment, &game.id)?;
    let body = source.fetch_text(&url).await?;
    let stubs = parse_earned(&body)?;
    debug!(game_id = %game.id, count = stubs.len(), "earned list decoded");
    Ok(Some(stubs))
}

pub async fn enrich(
    source: &Throttled,
    game_id: &str,
    stub: &AchievementStub,
) -> Result<Achievement, AppError> {
    let url = Url::parse(&stub.endpoint)
        .map_err(|e| AppError::Decode(format!("endpoint '{}': {e}", stub.endpoint)))?;
    let earned_at = earned_at(stub.timestamp)
        .ok_or_else(|| AppError::Decode(format!("timestamp {} out of range", stub.timestamp)))?;

    let html = source.fetch_text(&url).await?;
    let details = parse_achievement_details(&html, &url)?;

    Ok(Achievement {
        id: stub.award_id.clone(),
        game_id: game_id.to_string(),
        name: display_name(&stub.slug),
        description: details.description,
        icon: details.icon,
        earned_at,
    })
}

fn selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::Internal(format!("selector parse: {e}")))
}

pub fn parse_user_id(html_text: &str) -> Result<String, AppError> {
    let document = Html::parse_document(html_text);
    let id_sel = selector("[data-userid]")?;

    document
        .select(&id_sel)
        .next()
        .and_then(|n| n.value().attr("data-userid"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::SelectorMiss("no data-userid attribute in profile page".to_string())
        })
}

/// `page_url` resolves relative hrefs.
pub fn parse_games(html_text: &str, page_url: &Url) -> Result<Vec<Game>, AppError> {
    let document = Html::parse_document(html_text);
    let game_sel = selector("div.col.col-game.game-info")?;
    let link_sel = selector("h3 > a")?;
    let hours_sel = selector("span.hours")?;

    let mut games = Vec::new();
    for container in document.select(&game_sel) {
        let Some(link) = container.select(&link_sel).next() else {
            debug!(html = %container.html(), "game container without title link");
            continue;
        };

        let href = link.value().attr("href").unwrap_or_default().trim();
        let Ok(url) = page_url.join(href) else {
            warn!(href, "unparseable game link");
            continue;
        };
        let Some(id) = game_id_from_url(&url) else {
            warn!(href, "game link has no path segment to use as id");
            continue;
        };

        let playtime_text = container
            .select(&hours_sel)
            .next()
            .map(|n| n.text().collect::<String>())
            .unwrap_or_default();

        games.push(Game {
            id,
            title: collapse_whitespace(&link.text().collect::<String>()),
            trophy_count: 0,
            details: String::new(),
            image: String::new(),
            playtime_min: parse_playtime(&playtime_text),
            url: url.to_string(),
        });
    }

    Ok(games)
}

/// Trailing non-empty path segment, percent-decoded, ignoring any fragment.
pub fn game_id_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .rev()
        .find(|s| !s.is_empty())
        .map(percent_decoded)
}

/// Decoded text after `#`. `Endpoints` re-encodes it when building the API url.
pub fn url_fragment(url: &str) -> Option<String> {
    url.split_once('#')
        .map(|(_, fragment)| percent_decoded(fragment.trim()))
        .filter(|f| !f.is_empty())
}

fn percent_decoded(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().into_owned()
}

/// Minutes from text such as "3h 45m", "2h" or "45m". Anything else is 0.
pub fn parse_playtime(text: &str) -> u32 {
    let component = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse::<u32>().ok())
            .unwrap_or(0)
    };

    component(&HOURS)
        .saturating_mul(60)
        .saturating_add(component(&MINUTES))
}

pub fn parse_earned(json_text: &str) -> Result<Vec<AchievementStub>, AppError> {
    let response: EarnedResponse = serde_json::from_str(json_text)
        .map_err(|e| AppError::Decode(format!("earned list: {e}")))?;

    if !response.success {
        return Err(AppError::Api(
            "earned list responded with success=false".to_string(),
        ));
    }
    Ok(response.list)
}

pub fn parse_achievement_details(
    html_text: &str,
    page_url: &Url,
) -> Result<AchievementDetails, AppError> {
    let document = Html::parse_document(html_text);
    let snippet_sel = selector("div.col.award-details.snippet")?;
    let text_sel = selector("p")?;
    let img_sel = selector("img[src]")?;

    let snippet = document
        .select(&snippet_sel)
        .next()
        .ok_or_else(|| AppError::SelectorMiss("award snippet container".to_string()))?;

    let description = snippet
        .select(&text_sel)
        .map(|p| collapse_whitespace(&p.text().collect::<String>()))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let src = document
        .select(&img_sel)
        .filter_map(|n| n.value().attr("src"))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .ok_or_else(|| AppError::SelectorMiss("award icon image".to_string()))?;
    let icon = page_url
        .join(src)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| src.to_string());

    Ok(AchievementDetails { description, icon })
}

/// "boss-defeated" -> "Boss Defeated".
pub fn display_name(slug: &str) -> String {
    slug.replace('-', " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn earned_at(timestamp: f64) -> Option<DateTime<Utc>> {
    if !timestamp.is_finite() {
        return None;
    }
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(secs as i64, nanos)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing_page(games: &[(&str, &str, &str)]) -> String {
        let rows = games
            .iter()
            .map(|(href, title, hours)| {
                format!(
                    r#"<div class="col col-game game-info">
                         <h3><a href="{href}">{title}</a></h3>
                         <span class="hours">{hours}</span>
                       </div>"#
                )
            })
            .collect::<String>();
        format!("<html><body>{rows}</body></html>")
    }

    #[test]
    fn user_id_is_read_from_data_attribute() {
        let html = r#"<html><body><div class="profile" data-userid="42">x</div></body></html>"#;
        assert_eq!(parse_user_id(html).unwrap(), "42");
    }

    #[test]
    fn missing_or_empty_user_id_is_a_selector_miss() {
        let missing = "<html><body><div class=\"profile\">x</div></body></html>";
        assert!(matches!(
            parse_user_id(missing),
            Err(AppError::SelectorMiss(_))
        ));

        let empty = r#"<div data-userid="  "></div>"#;
        assert!(matches!(parse_user_id(empty), Err(AppError::SelectorMiss(_))));
    }

    #[test]
    fn listing_yields_one_game_per_container() {
        let base = Url::parse("https://www.exophase.com/psn/user/bob").unwrap();
        let html = listing_page(&[
            ("https://www.exophase.com/game/astro-bot-psn/#900", "Astro Bot", "12h 5m"),
            ("/game/elden-ring-psn/#901", " Elden\n  Ring ", "140h"),
            ("https://www.exophase.com/game/tetris-psn", "Tetris", ""),
        ]);

        let games = parse_games(&html, &base).unwrap();
        assert_eq!(games.len(), 3);
        assert!(games.iter().all(|g| !g.id.is_empty() && !g.title.is_empty()));

        assert_eq!(games[0].id, "astro-bot-psn");
        assert_eq!(games[0].playtime_min, 725);
        assert_eq!(games[1].id, "elden-ring-psn");
        assert_eq!(games[1].title, "Elden Ring");
        assert_eq!(
            games[1].url,
            "https://www.exophase.com/game/elden-ring-psn/#901"
        );
        assert_eq!(games[2].playtime_min, 0);
        assert_eq!(games[2].trophy_count, 0);
        assert!(games[2].image.is_empty() && games[2].details.is_empty());
    }

    #[test]
    fn container_without_title_link_is_skipped() {
        let base = Url::parse(WEB_BASE).unwrap();
        let html = r#"
            <div class="col col-game game-info"><h3>No link here</h3></div>
            <div class="col col-game game-info"><h3><a href="/game/a-psn#1">A</a></h3></div>
        "#;
        let games = parse_games(html, &base).unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].id, "a-psn");
    }

    #[test]
    fn links_without_a_usable_segment_are_skipped() {
        let base = Url::parse(WEB_BASE).unwrap();
        let html = listing_page(&[
            ("/", "Root", "1h"),
            ("http://[broken", "Broken", "1h"),
            ("/game/kept-psn/#3", "Kept", "1h"),
        ]);
        let games = parse_games(&html, &base).unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].id, "kept-psn");
    }

    #[test]
    fn non_ascii_game_ids_are_encoded_once() {
        let base = Url::parse(WEB_BASE).unwrap();
        let html = listing_page(&[("/game/pokémon-psn/#5", "Pokémon", "2h")]);
        let games = parse_games(&html, &base).unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].id, "pokémon-psn");

        let fragment = url_fragment(&games[0].url).unwrap();
        assert_eq!(fragment, "5");
        let earned = Endpoints::default()
            .earned_url(&fragment, &games[0].id)
            .unwrap();
        assert_eq!(
            earned.as_str(),
            "https://api.exophase.com/public/player/5/game/pok%C3%A9mon-psn/earned"
        );
    }

    #[test]
    fn playtime_parsing() {
        assert_eq!(parse_playtime("3h 45m"), 225);
        assert_eq!(parse_playtime("2h"), 120);
        assert_eq!(parse_playtime("45m"), 45);
        assert_eq!(parse_playtime("1,024h 1m"), 61_441);
        assert_eq!(parse_playtime(""), 0);
        assert_eq!(parse_playtime("n/a"), 0);
    }

    #[test]
    fn game_id_is_trailing_segment_without_fragment() {
        let url = Url::parse("https://site/psn/game/123-title").unwrap();
        assert_eq!(game_id_from_url(&url).as_deref(), Some("123-title"));

        let url = Url::parse("https://site/psn/game/123-title#777").unwrap();
        assert_eq!(game_id_from_url(&url).as_deref(), Some("123-title"));

        let url = Url::parse("https://site/").unwrap();
        assert_eq!(game_id_from_url(&url), None);
    }

    #[test]
    fn fragment_extraction() {
        assert_eq!(url_fragment("https://site/game/x#12345").as_deref(), Some("12345"));
        assert_eq!(url_fragment("https://site/game/x#12%2045").as_deref(), Some("12 45"));
        assert_eq!(url_fragment("https://site/game/x#"), None);
        assert_eq!(url_fragment("https://site/game/x"), None);
    }

    #[test]
    fn endpoint_templates() {
        let endpoints = Endpoints::default();
        assert_eq!(
            endpoints.profile_url("alice").unwrap().as_str(),
            "https://www.exophase.com/user/alice"
        );
        assert_eq!(
            endpoints.listing_url("alice_psn").unwrap().as_str(),
            "https://www.exophase.com/psn/user/alice_psn"
        );
        assert_eq!(
            endpoints.earned_url("12345", "123-title").unwrap().as_str(),
            "https://api.exophase.com/public/player/12345/game/123-title/earned"
        );
    }

    #[test]
    fn earned_list_with_success_false_is_an_api_error() {
        let json = r#"{"success": false, "list": []}"#;
        assert!(matches!(parse_earned(json), Err(AppError::Api(_))));

        let json = r#"{"success": false}"#;
        assert!(matches!(parse_earned(json), Err(AppError::Api(_))));
    }

    #[test]
    fn malformed_earned_list_is_a_decode_error() {
        assert!(matches!(parse_earned("<html>"), Err(AppError::Decode(_))));
    }

    #[test]
    fn earned_list_accepts_numeric_award_ids() {
        let json = r#"{
            "success": true,
            "list": [
                {"awardid": "a1", "slug": "first-blood", "timestamp": 1700000000.5, "endpoint": "https://x/a1"},
                {"awardid": 77, "slug": "second", "timestamp": 1700000001, "endpoint": "https://x/77"}
            ]
        }"#;
        let stubs = parse_earned(json).unwrap();
        assert_eq!(stubs.len(), 2);
        assert_eq!(stubs[0].award_id, "a1");
        assert_eq!(stubs[1].award_id, "77");
    }

    #[test]
    fn details_are_scraped_from_snippet_and_first_image() {
        let page = Url::parse("https://www.exophase.com/award/boss/").unwrap();
        let html = r#"
            <img src="/img/boss.png">
            <div class="col award-details snippet">
                <p>Defeat the   boss.</p>
                <p>Any difficulty.</p>
            </div>
            <img src="/img/other.png">
        "#;
        let details = parse_achievement_details(html, &page).unwrap();
        assert_eq!(details.description, "Defeat the boss. Any difficulty.");
        assert_eq!(details.icon, "https://www.exophase.com/img/boss.png");
    }

    #[test]
    fn details_without_snippet_or_icon_fail() {
        let page = Url::parse("https://www.exophase.com/award/boss/").unwrap();
        let no_snippet = r#"<img src="/img/boss.png"><p>text</p>"#;
        assert!(parse_achievement_details(no_snippet, &page).is_err());

        let no_icon = r#"<div class="col award-details snippet"><p>text</p></div>"#;
        assert!(parse_achievement_details(no_icon, &page).is_err());
    }

    #[test]
    fn display_name_from_slug() {
        assert_eq!(display_name("boss-defeated"), "Boss Defeated");
        assert_eq!(display_name("the-END-is-nigh"), "The End Is Nigh");
        assert_eq!(display_name(""), "");
    }

    #[test]
    fn earned_at_converts_epoch_seconds() {
        let t = earned_at(1_700_000_000.25).unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
        assert_eq!(t.timestamp_subsec_millis(), 250);
        assert!(earned_at(f64::NAN).is_none());
    }
}
