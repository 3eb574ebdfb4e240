// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Pure XML fragment extraction over a stored metadata blob (spec §4.3).
//!
//! The on-wire metadata blob is a single `<UpdateInfo>` document with three
//! extractable regions: `<Core>` (identity + applicability essentials,
//! returned inside every sync response), `<Extended>` (file locations and
//! handler-specific data) and a `<LocalizedPropertiesCollection>` of
//! per-language `<LocalizedProperties>` blocks.

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed metadata xml")]
    Parse(#[from] quick_xml::Error),
    #[error("metadata xml is missing a <{0}> element")]
    MissingElement(String),
}

/// The applicability-essential fragment returned inside every `UpdateInfo`
/// in a sync response, including its own `<Core>...</Core>` tags.
pub fn core_fragment(xml: &str) -> Result<String, Error> {
    first_element(xml, "Core")
}

/// File locations and handler-specific data, returned by
/// `getExtendedUpdateInfo` (spec §6).
pub fn extended_fragment(xml: &str) -> Result<String, Error> {
    first_element(xml, "Extended")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalizedProperties {
    pub language: String,
    pub title: String,
    pub description: String,
}

/// Title/description for the best-matching locale, falling back to `en`
/// when none of `locales` is present (spec §4.3).
pub fn localized_properties(xml: &str, locales: &[String]) -> Result<LocalizedProperties, Error> {
    let collection = first_element(xml, "LocalizedPropertiesCollection")?;
    let blocks = element_spans(&collection, "LocalizedProperties")?
        .into_iter()
        .map(|(start, end)| parse_localized_block(&collection[start..end]))
        .collect::<Result<Vec<_>, _>>()?;

    locales
        .iter()
        .find_map(|locale| blocks.iter().find(|b| &b.language == locale))
        .or_else(|| blocks.iter().find(|b| b.language == "en"))
        .or_else(|| blocks.first())
        .cloned()
        .ok_or_else(|| Error::MissingElement("LocalizedProperties".into()))
}

fn parse_localized_block(block: &str) -> Result<LocalizedProperties, Error> {
    Ok(LocalizedProperties {
        language: element_text(block, "Language")?.unwrap_or_default(),
        title: element_text(block, "Title")?.unwrap_or_default(),
        description: element_text(block, "Description")?.unwrap_or_default(),
    })
}

/// Returns the first occurrence of `name`, tags included.
fn first_element(xml: &str, name: &str) -> Result<String, Error> {
    element_spans(xml, name)?
        .first()
        .map(|&(start, end)| xml[start..end].to_string())
        .ok_or_else(|| Error::MissingElement(name.into()))
}

/// The concatenated text content of the first occurrence of `name`, or
/// `None` if `name` does not appear.
fn element_text(xml: &str, name: &str) -> Result<Option<String>, Error> {
    let Some(&(start, end)) = element_spans(xml, name)?.first() else {
        return Ok(None);
    };

    let mut reader = Reader::from_str(&xml[start..end]);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(e)) => text.push_str(&e.unescape()?),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }
        buf.clear();
    }

    Ok(Some(text))
}

/// Byte spans (start of `<name`, through end of matching `</name>` or a
/// self-closing `<name.../>`) of every top-level, non-nested occurrence of
/// `name` in `xml`. Depth is tracked generically so a `name` nested inside
/// an unrelated ancestor of the same tag name is not mistaken for a sibling.
fn element_spans(xml: &str, name: &str) -> Result<Vec<(usize, usize)>, Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut buf = Vec::new();
    let mut depth: usize = 0;
    let mut capture: Option<(usize, usize)> = None;
    let mut spans = Vec::new();

    loop {
        let pos_before = reader.buffer_position() as usize;
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                depth += 1;
                if capture.is_none() && e.name().as_ref() == name.as_bytes() {
                    capture = Some((pos_before, depth));
                }
            }
            Ok(Event::Empty(e)) => {
                if capture.is_none() && e.name().as_ref() == name.as_bytes() {
                    spans.push((pos_before, reader.buffer_position() as usize));
                }
            }
            Ok(Event::End(_)) => {
                if let Some((start, capture_depth)) = capture {
                    if capture_depth == depth {
                        spans.push((start, reader.buffer_position() as usize));
                        capture = None;
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }
        buf.clear();
    }

    Ok(spans)
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"
        <UpdateInfo>
            <Core>
                <Id>3f5a1b2c-0000-0000-0000-000000000001</Id>
                <Revision>2</Revision>
            </Core>
            <Extended>
                <FileLocations>
                    <FileLocation url="https://cdn.example/a.cab"/>
                </FileLocations>
            </Extended>
            <LocalizedPropertiesCollection>
                <LocalizedProperties>
                    <Language>en</Language>
                    <Title>English title</Title>
                    <Description>English description</Description>
                </LocalizedProperties>
                <LocalizedProperties>
                    <Language>fr</Language>
                    <Title>Titre francais</Title>
                    <Description>Description francaise</Description>
                </LocalizedProperties>
            </LocalizedPropertiesCollection>
        </UpdateInfo>
    "#;

    #[test]
    fn extracts_core_fragment() {
        let core = core_fragment(SAMPLE).unwrap();
        assert!(core.starts_with("<Core>"));
        assert!(core.contains("<Revision>2</Revision>"));
    }

    #[test]
    fn extracts_extended_fragment() {
        let extended = extended_fragment(SAMPLE).unwrap();
        assert!(extended.contains("FileLocation"));
    }

    #[test]
    fn picks_requested_locale() {
        let props = localized_properties(SAMPLE, &["fr".to_string()]).unwrap();
        assert_eq!(props.title, "Titre francais");
    }

    #[test]
    fn falls_back_to_en_when_locale_missing() {
        let props = localized_properties(SAMPLE, &["de".to_string()]).unwrap();
        assert_eq!(props.language, "en");
    }

    #[test]
    fn missing_element_is_reported() {
        let err = core_fragment("<UpdateInfo></UpdateInfo>").unwrap_err();
        assert!(matches!(err, Error::MissingElement(ref name) if name == "Core"));
    }
}
