use anyhow::{anyhow, Result};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

use crate::cli::config::ParserSettings;
use crate::crawler::task::Listing;

/// Turns a results page into listings
pub trait ListingParser: Send + Sync {
    fn parse_listings(&self, html: &str, base_url: &str) -> Result<Vec<Listing>>;
}

fn compile(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow!("Invalid selector '{}': {:?}", selector, e))
}

fn compile_optional(selector: &Option<String>) -> Result<Option<Selector>> {
    selector.as_deref().map(compile).transpose()
}

/// CSS-selector driven parser for classifieds result pages
pub struct SelectorListingParser {
    item: Selector,
    id_attribute: String,
    title: Selector,
    link: Selector,
    price: Option<Selector>,
    location: Option<Selector>,
    image: Option<Selector>,
}

impl SelectorListingParser {
    pub fn new(settings: &ParserSettings) -> Result<Self> {
        Ok(Self {
            item: compile(&settings.item_selector)?,
            id_attribute: settings.id_attribute.clone(),
            title: compile(&settings.title_selector)?,
            link: compile(&settings.link_selector)?,
            price: compile_optional(&settings.price_selector)?,
            location: compile_optional(&settings.location_selector)?,
            image: compile_optional(&settings.image_selector)?,
        })
    }

    fn text_of(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
        let text = element
            .select(selector)
            .next()?
            .text()
            .collect::<Vec<_>>()
            .join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    }

    fn parse_item(&self, element: ElementRef<'_>, base: &Url) -> Option<Listing> {
        let link = element.select(&self.link).next()?;
        let href = link.value().attr("href")?;
        let url = base.join(href).ok()?;

        let title = Self::text_of(element, &self.title)?;

        let id = element
            .value()
            .attr(&self.id_attribute)
            .map(str::to_string)
            .or_else(|| id_from_url(&url))
            .unwrap_or_else(|| url.to_string());

        let image_url = self.image.as_ref().and_then(|selector| {
            let img = element.select(selector).next()?;
            let src = img.value().attr("src").or_else(|| img.value().attr("data-src"))?;
            base.join(src).ok().map(|u| u.to_string())
        });

        Some(Listing {
            id,
            title,
            url: url.to_string(),
            price: self.price.as_ref().and_then(|s| Self::text_of(element, s)),
            location: self.location.as_ref().and_then(|s| Self::text_of(element, s)),
            image_url,
        })
    }
}

/// Classifieds URLs usually end in `<id>-<category>-<...>` or carry the id as the last numeric segment
fn id_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let digits: String = last.chars().take_while(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

impl ListingParser for SelectorListingParser {
    fn parse_listings(&self, html: &str, base_url: &str) -> Result<Vec<Listing>> {
        let base = Url::parse(base_url).map_err(|e| anyhow!("Invalid base URL {}: {}", base_url, e))?;
        let document = Html::parse_document(html);

        let mut seen = HashSet::new();
        let listings = document
            .select(&self.item)
            .filter_map(|element| self.parse_item(element, &base))
            .filter(|listing| seen.insert(listing.id.clone()))
            .collect();

        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<html><body>
  <ul>
    <li><article class="aditem" data-adid="1001">
      <div class="aditem-main--top--left"> 10115 Mitte </div>
      <h2><a href="/s-anzeige/road-bike/1001-217-3331">Road bike,  56cm</a></h2>
      <p class="aditem-main--middle--price-shipping--price">450 € VB</p>
      <img src="https://img.classifieds.example/1001.jpg">
    </article></li>
    <li><article class="aditem">
      <h2><a href="/s-anzeige/gravel-bike/2002-217-3331">Gravel bike</a></h2>
    </article></li>
    <li><article class="aditem" data-adid="1001">
      <h2><a href="/s-anzeige/road-bike/1001-217-3331">Duplicate</a></h2>
    </article></li>
    <li><article class="aditem" data-adid="3003"><h2>No link</h2></article></li>
  </ul>
</body></html>"#;

    fn parser() -> SelectorListingParser {
        SelectorListingParser::new(&ParserSettings::default()).unwrap()
    }

    #[test]
    fn test_parse_listings() {
        let listings = parser()
            .parse_listings(PAGE, "https://classifieds.example/s-bikes/k0")
            .unwrap();

        assert_eq!(listings.len(), 2);

        let first = &listings[0];
        assert_eq!(first.id, "1001");
        assert_eq!(first.title, "Road bike, 56cm");
        assert_eq!(first.url, "https://classifieds.example/s-anzeige/road-bike/1001-217-3331");
        assert_eq!(first.price.as_deref(), Some("450 € VB"));
        assert_eq!(first.location.as_deref(), Some("10115 Mitte"));
        assert_eq!(first.image_url.as_deref(), Some("https://img.classifieds.example/1001.jpg"));

        // Id falls back to the URL
        assert_eq!(listings[1].id, "2002");
        assert!(listings[1].price.is_none());
    }

    #[test]
    fn test_ids_are_stable() {
        let parser = parser();
        let first = parser.parse_listings(PAGE, "https://classifieds.example/").unwrap();
        let second = parser.parse_listings(PAGE, "https://classifieds.example/").unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_selector_rejected() {
        let settings = ParserSettings {
            item_selector: "article[".to_string(),
            ..ParserSettings::default()
        };

        assert!(SelectorListingParser::new(&settings).is_err());
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(parser().parse_listings(PAGE, "not a url").is_err());
    }
}
