//! Typed bindings over the XML definition files.
//!
//! Three document kinds are understood: Information Element definitions
//! (`<ipfix-elements>`), aliases (`<ipfix-aliases>`) and value mappings
//! (`<ipfix-mapping>`). The bindings read a `quick-xml` event stream and
//! produce plain declaration records; all registry semantics (uniqueness,
//! biflow synthesis, reference resolution) live in the manager itself.
//!
//! Unknown child elements are skipped so that newer definition files stay
//! loadable.

use crate::Error;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// `<scope>` declaration with its child `<element>`s.
#[derive(Debug, Clone, Default)]
pub struct ScopeDecl {
    pub pen: Option<u32>,
    pub name: Option<String>,
    pub biflow_mode: Option<String>,
    pub biflow_id: Option<u32>,
    pub overwrite: bool,
    pub elements: Vec<ElementDecl>,
}

/// `<element>` declaration inside a scope.
#[derive(Debug, Clone, Default)]
pub struct ElementDecl {
    pub id: Option<u16>,
    pub name: Option<String>,
    pub data_type: Option<String>,
    pub data_semantics: Option<String>,
    pub units: Option<String>,
    pub status: Option<String>,
    pub biflow_id: Option<u16>,
}

/// `<element>` declaration of an alias file.
#[derive(Debug, Clone, Default)]
pub struct AliasDecl {
    pub name: Option<String>,
    pub aliased_names: Vec<String>,
    pub mode: Option<String>,
    pub sources: Vec<String>,
}

/// `<group>` declaration of a mapping file.
#[derive(Debug, Clone, Default)]
pub struct MappingDecl {
    pub name: Option<String>,
    pub matches: Vec<String>,
    pub case_sensitive: bool,
    pub items: Vec<(String, i64)>,
}

fn xml_err(ctx: &str, err: quick_xml::Error) -> Error {
    Error::Format(format!("XML error in {ctx}: {err}"))
}

/// Reads the text content of the element just opened, consuming its end tag.
fn read_text(reader: &mut Reader<&[u8]>, ctx: &str) -> Result<String, Error> {
    let mut buf = Vec::new();
    let mut text = String::new();
    loop {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Text(t) => {
                text.push_str(&t.unescape_and_decode(reader).map_err(|e| xml_err(ctx, e))?);
            }
            Event::CData(t) => {
                text.push_str(&String::from_utf8_lossy(&t));
            }
            Event::End(_) => return Ok(text.trim().to_string()),
            Event::Eof => return Err(Error::Format(format!("unexpected EOF in {ctx}"))),
            // Nested markup inside a scalar value is not part of the schema.
            Event::Start(_) | Event::Empty(_) => {
                return Err(Error::Format(format!("unexpected child element in {ctx}")));
            }
            _ => {}
        }
        buf.clear();
    }
}

/// Skips the subtree of the element just opened.
fn skip_element(reader: &mut Reader<&[u8]>, ctx: &str) -> Result<(), Error> {
    let mut depth = 1u32;
    let mut buf = Vec::new();
    while depth > 0 {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Start(_) => depth += 1,
            Event::End(_) => depth -= 1,
            Event::Eof => return Err(Error::Format(format!("unexpected EOF in {ctx}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn parse_number<T>(text: &str, ctx: &str) -> Result<T, Error>
where
    T: std::str::FromStr,
{
    text.parse()
        .map_err(|_| Error::Format(format!("invalid number '{text}' in {ctx}")))
}

fn attribute(start: &BytesStart, name: &[u8], ctx: &str) -> Result<Option<String>, Error> {
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::Format(format!("bad attribute in {ctx}: {e}")))?;
        if attr.key == name {
            let value = String::from_utf8_lossy(&attr.value).into_owned();
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Parses an `<ipfix-elements>` document.
pub fn parse_elements_file(content: &str, ctx: &str) -> Result<Vec<ScopeDecl>, Error> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut scopes = Vec::new();
    let mut in_root = false;

    loop {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Start(start) => {
                let name = start.local_name().to_vec();
                if !in_root {
                    if name != b"ipfix-elements" {
                        return Err(Error::Format(format!(
                            "{ctx}: expected root <ipfix-elements>, found <{}>",
                            String::from_utf8_lossy(&name)
                        )));
                    }
                    in_root = true;
                } else if name == b"scope" {
                    scopes.push(parse_scope(&mut reader, &start, ctx)?);
                } else {
                    skip_element(&mut reader, ctx)?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !in_root {
        return Err(Error::Format(format!("{ctx}: missing <ipfix-elements> root")));
    }
    Ok(scopes)
}

fn parse_scope(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
    ctx: &str,
) -> Result<ScopeDecl, Error> {
    let mut scope = ScopeDecl {
        overwrite: attribute(start, b"overwrite", ctx)?
            .map(|v| v == "true" || v == "yes")
            .unwrap_or(true),
        ..ScopeDecl::default()
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Start(child) => match child.local_name() {
                b"pen" => scope.pen = Some(parse_number(&read_text(reader, ctx)?, ctx)?),
                b"name" => scope.name = Some(read_text(reader, ctx)?),
                b"biflow" => {
                    scope.biflow_mode = attribute(&child, b"mode", ctx)?;
                    let text = read_text(reader, ctx)?;
                    if !text.is_empty() {
                        scope.biflow_id = Some(parse_number(&text, ctx)?);
                    }
                }
                b"element" => scope.elements.push(parse_element(reader, ctx)?),
                _ => skip_element(reader, ctx)?,
            },
            Event::Empty(child) => {
                if child.local_name() == b"biflow" {
                    scope.biflow_mode = attribute(&child, b"mode", ctx)?;
                }
            }
            Event::End(_) => break,
            Event::Eof => return Err(Error::Format(format!("unexpected EOF in {ctx}"))),
            _ => {}
        }
        buf.clear();
    }

    if scope.pen.is_none() {
        return Err(Error::Format(format!("{ctx}: <scope> without mandatory <pen>")));
    }
    Ok(scope)
}

fn parse_element(reader: &mut Reader<&[u8]>, ctx: &str) -> Result<ElementDecl, Error> {
    let mut elem = ElementDecl::default();

    let mut buf = Vec::new();
    loop {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Start(child) => match child.local_name() {
                b"id" => elem.id = Some(parse_number(&read_text(reader, ctx)?, ctx)?),
                b"name" => elem.name = Some(read_text(reader, ctx)?),
                b"dataType" => elem.data_type = Some(read_text(reader, ctx)?),
                b"dataSemantics" => elem.data_semantics = Some(read_text(reader, ctx)?),
                b"units" => elem.units = Some(read_text(reader, ctx)?),
                b"status" => elem.status = Some(read_text(reader, ctx)?),
                b"biflowId" => elem.biflow_id = Some(parse_number(&read_text(reader, ctx)?, ctx)?),
                _ => skip_element(reader, ctx)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(Error::Format(format!("unexpected EOF in {ctx}"))),
            _ => {}
        }
        buf.clear();
    }

    if elem.id.is_none() {
        return Err(Error::Format(format!("{ctx}: <element> without mandatory <id>")));
    }
    Ok(elem)
}

/// Parses an `<ipfix-aliases>` document.
pub fn parse_aliases_file(content: &str, ctx: &str) -> Result<Vec<AliasDecl>, Error> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut aliases = Vec::new();
    let mut in_root = false;

    loop {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Start(start) => {
                let name = start.local_name().to_vec();
                if !in_root {
                    if name != b"ipfix-aliases" {
                        return Err(Error::Format(format!(
                            "{ctx}: expected root <ipfix-aliases>, found <{}>",
                            String::from_utf8_lossy(&name)
                        )));
                    }
                    in_root = true;
                } else if name == b"element" {
                    aliases.push(parse_alias(&mut reader, ctx)?);
                } else {
                    skip_element(&mut reader, ctx)?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(aliases)
}

fn parse_alias(reader: &mut Reader<&[u8]>, ctx: &str) -> Result<AliasDecl, Error> {
    let mut alias = AliasDecl::default();

    let mut buf = Vec::new();
    loop {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Start(child) => match child.local_name() {
                b"name" => alias.name = Some(read_text(reader, ctx)?),
                b"alias" => alias.aliased_names.push(read_text(reader, ctx)?),
                b"source" => {
                    alias.mode = attribute(&child, b"mode", ctx)?;
                    parse_alias_sources(reader, &mut alias.sources, ctx)?;
                }
                _ => skip_element(reader, ctx)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(Error::Format(format!("unexpected EOF in {ctx}"))),
            _ => {}
        }
        buf.clear();
    }

    if alias.name.is_none() {
        return Err(Error::Format(format!("{ctx}: alias <element> without <name>")));
    }
    Ok(alias)
}

fn parse_alias_sources(
    reader: &mut Reader<&[u8]>,
    sources: &mut Vec<String>,
    ctx: &str,
) -> Result<(), Error> {
    let mut buf = Vec::new();
    loop {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Start(child) => {
                if child.local_name() == b"id" {
                    sources.push(read_text(reader, ctx)?);
                } else {
                    skip_element(reader, ctx)?;
                }
            }
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(Error::Format(format!("unexpected EOF in {ctx}"))),
            _ => {}
        }
        buf.clear();
    }
}

/// Parses an `<ipfix-mapping>` document.
pub fn parse_mappings_file(content: &str, ctx: &str) -> Result<Vec<MappingDecl>, Error> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut mappings = Vec::new();
    let mut in_root = false;

    loop {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Start(start) => {
                let name = start.local_name().to_vec();
                if !in_root {
                    if name != b"ipfix-mapping" {
                        return Err(Error::Format(format!(
                            "{ctx}: expected root <ipfix-mapping>, found <{}>",
                            String::from_utf8_lossy(&name)
                        )));
                    }
                    in_root = true;
                } else if name == b"group" {
                    mappings.push(parse_mapping_group(&mut reader, ctx)?);
                } else {
                    skip_element(&mut reader, ctx)?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(mappings)
}

fn parse_mapping_group(reader: &mut Reader<&[u8]>, ctx: &str) -> Result<MappingDecl, Error> {
    let mut group = MappingDecl {
        case_sensitive: true,
        ..MappingDecl::default()
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Start(child) => match child.local_name() {
                b"name" => group.name = Some(read_text(reader, ctx)?),
                b"match" => group.matches.push(read_text(reader, ctx)?),
                b"item-list" => {
                    if let Some(mode) = attribute(&child, b"mode", ctx)? {
                        group.case_sensitive = match mode.as_str() {
                            "caseSensitive" => true,
                            "caseInsensitive" => false,
                            other => {
                                return Err(Error::Format(format!(
                                    "{ctx}: invalid item-list mode '{other}'"
                                )));
                            }
                        };
                    }
                    parse_mapping_items(reader, &mut group.items, ctx)?;
                }
                _ => skip_element(reader, ctx)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(Error::Format(format!("unexpected EOF in {ctx}"))),
            _ => {}
        }
        buf.clear();
    }

    if group.name.is_none() {
        return Err(Error::Format(format!("{ctx}: mapping <group> without <name>")));
    }
    Ok(group)
}

fn parse_mapping_items(
    reader: &mut Reader<&[u8]>,
    items: &mut Vec<(String, i64)>,
    ctx: &str,
) -> Result<(), Error> {
    let mut buf = Vec::new();
    loop {
        match reader.read_event(&mut buf).map_err(|e| xml_err(ctx, e))? {
            Event::Start(child) => {
                if child.local_name() == b"item" {
                    let mut key = None;
                    let mut value = None;
                    let mut inner = Vec::new();
                    loop {
                        match reader.read_event(&mut inner).map_err(|e| xml_err(ctx, e))? {
                            Event::Start(grand) => match grand.local_name() {
                                b"key" => key = Some(read_text(reader, ctx)?),
                                b"value" => {
                                    value = Some(parse_number(&read_text(reader, ctx)?, ctx)?)
                                }
                                _ => skip_element(reader, ctx)?,
                            },
                            Event::End(_) => break,
                            Event::Eof => {
                                return Err(Error::Format(format!("unexpected EOF in {ctx}")));
                            }
                            _ => {}
                        }
                        inner.clear();
                    }

                    match (key, value) {
                        (Some(k), Some(v)) => items.push((k, v)),
                        _ => {
                            return Err(Error::Format(format!(
                                "{ctx}: <item> must contain <key> and <value>"
                            )));
                        }
                    }
                } else {
                    skip_element(reader, ctx)?;
                }
            }
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(Error::Format(format!("unexpected EOF in {ctx}"))),
            _ => {}
        }
        buf.clear();
    }
}
