//! HTML listing extraction: turn a scraped listings page into ingest rows.

use lpt_core::ListingInput;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "lpt-adapters";
pub const GENERIC_SOURCE_NAME: &str = "example_listings";

/// Listing containers, tried in order; the first selector with matches wins.
const BLOCK_SELECTORS: [&str; 3] = ["[data-listing]", ".listing", "article.listing"];
const TITLE_SELECTOR: &str = ".title, [data-title], h2, h3";
const PRICE_SELECTOR: &str = ".price, [data-price]";
const ADDRESS_SELECTOR: &str = ".address, [data-address]";
const AREA_SELECTOR: &str = ".area, [data-area], .region";
const LINK_SELECTOR: &str = "a[href]";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

pub trait ListingExtractor: Send + Sync {
    fn source_name(&self) -> &str;
    fn extract_from_html(&self, html: &str, page_url: &str) -> Vec<ListingInput>;
}

#[derive(Debug, Clone)]
struct ListingSelectors {
    blocks: Vec<Selector>,
    title: Selector,
    price: Selector,
    address: Selector,
    area: Selector,
    link: Selector,
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

impl ListingSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            blocks: BLOCK_SELECTORS
                .iter()
                .map(|s| parse_selector(s))
                .collect::<Result<Vec<_>, _>>()?,
            title: parse_selector(TITLE_SELECTOR)?,
            price: parse_selector(PRICE_SELECTOR)?,
            address: parse_selector(ADDRESS_SELECTOR)?,
            area: parse_selector(AREA_SELECTOR)?,
            link: parse_selector(LINK_SELECTOR)?,
        })
    }
}

/// Class/data-attribute driven extractor for simple listing pages.
#[derive(Debug, Clone)]
pub struct GenericListingExtractor {
    source: String,
    selectors: ListingSelectors,
}

impl GenericListingExtractor {
    pub fn new() -> Result<Self, AdapterError> {
        Self::with_source(GENERIC_SOURCE_NAME)
    }

    pub fn with_source(source: impl Into<String>) -> Result<Self, AdapterError> {
        Ok(Self {
            source: source.into(),
            selectors: ListingSelectors::new()?,
        })
    }

    fn blocks<'a>(&self, document: &'a Html) -> Vec<ElementRef<'a>> {
        self.selectors
            .blocks
            .iter()
            .map(|sel| document.select(sel).collect::<Vec<_>>())
            .find(|found| !found.is_empty())
            .unwrap_or_default()
    }

    fn block_to_input(&self, index: usize, block: ElementRef<'_>, base: Option<&Url>) -> ListingInput {
        let source_id = block
            .value()
            .attr("data-id")
            .or_else(|| block.value().attr("id"))
            .and_then(|s| text_or_none(s.to_string()))
            .unwrap_or_else(|| format!("item-{index}"));
        let title = first_text(block, &self.selectors.title).unwrap_or_else(|| format!("Listing {index}"));
        let price = first_text(block, &self.selectors.price).and_then(|t| parse_price(&t));
        let url = block
            .select(&self.selectors.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| text_or_none(href.to_string()))
            .map(|href| resolve_link(base, &href));

        ListingInput {
            source_id: Some(source_id),
            source: Some(self.source.clone()),
            title: Some(title),
            address: first_text(block, &self.selectors.address),
            area: first_text(block, &self.selectors.area),
            url,
            price,
        }
    }
}

impl ListingExtractor for GenericListingExtractor {
    fn source_name(&self) -> &str {
        &self.source
    }

    fn extract_from_html(&self, html: &str, page_url: &str) -> Vec<ListingInput> {
        let document = Html::parse_document(html);
        let base = Url::parse(page_url).ok();
        self.blocks(&document)
            .into_iter()
            .enumerate()
            .map(|(index, block)| self.block_to_input(index, block, base.as_ref()))
            .collect()
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(block: ElementRef<'_>, selector: &Selector) -> Option<String> {
    block
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn resolve_link(base: Option<&Url>, href: &str) -> String {
    if href.starts_with("http") {
        return href.to_string();
    }
    base.and_then(|b| b.join(href).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| href.to_string())
}

/// Keep digits and dots from a display price ("$1,250,000" -> 1250000.0).
pub fn parse_price(text: &str) -> Option<f64> {
    let digits = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect::<String>();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<f64>().ok()
}
