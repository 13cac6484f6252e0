//! On-disk XML form of profiles and sync logs.
//!
//! Documents are UTF-8 with an XML declaration and 4-space indentation; the
//! format is stable so external tooling can roundtrip it. `parse_profile`
//! and `write_profile` are inverse for all well-formed profiles, as are
//! `parse_log` / `write_log`.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::profile::{Profile, ProfileType};
use crate::results::{MajorCode, MinorCode, SyncLog, SyncResults};
use crate::schedule::SyncSchedule;

const TIME_FORMAT: &str = "%H:%M";

/// Errors from document parsing or rendering.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("invalid attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),

    #[error("write error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    Malformed(String),
}

fn malformed(msg: impl Into<String>) -> XmlError {
    XmlError::Malformed(msg.into())
}

// ---------------------------------------------------------------------------
// Attribute helpers
// ---------------------------------------------------------------------------

struct Attrs(Vec<(String, String)>);

impl Attrs {
    fn parse(e: &BytesStart<'_>) -> Result<Self, XmlError> {
        let mut attrs = Vec::new();
        for attr in e.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attrs.push((key, value));
        }
        Ok(Self(attrs))
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, name: &str, element: &str) -> Result<&str, XmlError> {
        self.get(name)
            .ok_or_else(|| malformed(format!("<{element}> is missing the '{name}' attribute")))
    }
}

// ---------------------------------------------------------------------------
// Profile documents
// ---------------------------------------------------------------------------

/// Parse a profile document.
pub fn parse_profile(input: &str) -> Result<Profile, XmlError> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Profile> = Vec::new();
    let mut root: Option<Profile> = None;

    loop {
        match reader.read_event()? {
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) => {}
            Event::Start(e) => match e.name().as_ref() {
                b"profile" => {
                    if root.is_some() {
                        return Err(malformed("multiple root elements"));
                    }
                    stack.push(profile_from_attrs(&e)?);
                }
                b"key" | b"schedule" => {
                    // Accept the non-self-closing spelling of leaf elements.
                    apply_leaf(&mut stack, &e)?;
                }
                other => {
                    return Err(malformed(format!(
                        "unexpected element <{}>",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"profile" => {
                    let child = profile_from_attrs(&e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.sub_profiles.push(child),
                        None if root.is_none() => root = Some(child),
                        None => return Err(malformed("multiple root elements")),
                    }
                }
                b"key" | b"schedule" => apply_leaf(&mut stack, &e)?,
                other => {
                    return Err(malformed(format!(
                        "unexpected element <{}>",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::End(e) => {
                if e.name().as_ref() == b"profile" {
                    let finished = stack
                        .pop()
                        .ok_or_else(|| malformed("unbalanced </profile>"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.sub_profiles.push(finished),
                        None => root = Some(finished),
                    }
                }
            }
            Event::Eof => break,
            _ => return Err(malformed("unexpected document content")),
        }
    }

    if !stack.is_empty() {
        return Err(malformed("unterminated <profile> element"));
    }
    root.ok_or_else(|| malformed("missing root <profile> element"))
}

fn profile_from_attrs(e: &BytesStart<'_>) -> Result<Profile, XmlError> {
    let attrs = Attrs::parse(e)?;
    let name = attrs.required("name", "profile")?;
    let type_str = attrs.required("type", "profile")?;
    let profile_type = ProfileType::from_str(type_str).map_err(malformed)?;
    if name.is_empty() {
        return Err(malformed("<profile> name must not be empty"));
    }
    Ok(Profile::new(name, profile_type))
}

fn apply_leaf(stack: &mut [Profile], e: &BytesStart<'_>) -> Result<(), XmlError> {
    let is_schedule = e.name().as_ref() == b"schedule";
    let depth = stack.len();
    let Some(target) = stack.last_mut() else {
        return Err(malformed("element outside of a <profile>"));
    };
    if is_schedule {
        if depth != 1 || target.profile_type != ProfileType::Sync {
            return Err(malformed("<schedule> is only valid on a root sync profile"));
        }
        target.schedule = Some(schedule_from_attrs(e)?);
    } else {
        let attrs = Attrs::parse(e)?;
        let name = attrs.required("name", "key")?;
        let value = attrs.required("value", "key")?;
        target.set_key(name, value);
    }
    Ok(())
}

fn schedule_from_attrs(e: &BytesStart<'_>) -> Result<SyncSchedule, XmlError> {
    let attrs = Attrs::parse(e)?;

    let enabled = attrs.get("enabled") == Some("true");
    let interval_minutes = match attrs.get("interval") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| malformed(format!("invalid schedule interval '{raw}'")))?,
        None => 0,
    };

    let mut days = BTreeSet::new();
    if let Some(raw) = attrs.get("days") {
        for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
            let day = part
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|d| (1..=7).contains(d))
                .ok_or_else(|| malformed(format!("invalid schedule day '{part}'")))?;
            days.insert(day);
        }
    }

    let parse_time = |name: &str| -> Result<Option<NaiveTime>, XmlError> {
        attrs
            .get(name)
            .map(|raw| {
                NaiveTime::parse_from_str(raw, TIME_FORMAT)
                    .map_err(|_| malformed(format!("invalid schedule time '{raw}'")))
            })
            .transpose()
    };

    Ok(SyncSchedule {
        enabled,
        days,
        start_time: parse_time("start")?,
        end_time: parse_time("end")?,
        interval_minutes,
    })
}

/// Render a profile to its canonical document form.
pub fn write_profile(profile: &Profile) -> Result<String, XmlError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_profile_element(&mut writer, profile)?;
    String::from_utf8(writer.into_inner()).map_err(|e| malformed(e.to_string()))
}

fn write_profile_element(writer: &mut Writer<Vec<u8>>, p: &Profile) -> Result<(), XmlError> {
    let type_name = p.profile_type.to_string();
    let mut elem = BytesStart::new("profile");
    elem.push_attribute(("name", p.name.as_str()));
    elem.push_attribute(("type", type_name.as_str()));

    let childless = p.keys.is_empty() && p.schedule.is_none() && p.sub_profiles.is_empty();
    if childless {
        writer.write_event(Event::Empty(elem))?;
        return Ok(());
    }

    writer.write_event(Event::Start(elem))?;
    for (key, value) in &p.keys {
        let mut k = BytesStart::new("key");
        k.push_attribute(("name", key.as_str()));
        k.push_attribute(("value", value.as_str()));
        writer.write_event(Event::Empty(k))?;
    }
    if let Some(schedule) = &p.schedule {
        write_schedule_element(writer, schedule)?;
    }
    for sub in &p.sub_profiles {
        write_profile_element(writer, sub)?;
    }
    writer.write_event(Event::End(BytesEnd::new("profile")))?;
    Ok(())
}

fn write_schedule_element(
    writer: &mut Writer<Vec<u8>>,
    schedule: &SyncSchedule,
) -> Result<(), XmlError> {
    let days = schedule
        .days
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let start = schedule
        .start_time
        .map(|t| t.format(TIME_FORMAT).to_string());
    let end = schedule.end_time.map(|t| t.format(TIME_FORMAT).to_string());
    let interval = schedule.interval_minutes.to_string();

    let mut elem = BytesStart::new("schedule");
    elem.push_attribute(("enabled", if schedule.enabled { "true" } else { "false" }));
    if !schedule.days.is_empty() {
        elem.push_attribute(("days", days.as_str()));
    }
    if let Some(start) = &start {
        elem.push_attribute(("start", start.as_str()));
    }
    if let Some(end) = &end {
        elem.push_attribute(("end", end.as_str()));
    }
    elem.push_attribute(("interval", interval.as_str()));
    writer.write_event(Event::Empty(elem))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync log documents
// ---------------------------------------------------------------------------

/// Parse a sync log document.
pub fn parse_log(input: &str) -> Result<SyncLog, XmlError> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut profile_name: Option<String> = None;
    let mut entries: Vec<SyncResults> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) | Event::End(_) => {}
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"synclog" => {
                    let attrs = Attrs::parse(&e)?;
                    profile_name = Some(attrs.required("name", "synclog")?.to_owned());
                }
                b"result" => {
                    if profile_name.is_none() {
                        return Err(malformed("<result> outside of <synclog>"));
                    }
                    entries.push(result_from_attrs(&e)?);
                }
                other => {
                    return Err(malformed(format!(
                        "unexpected element <{}>",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Eof => break,
            _ => return Err(malformed("unexpected document content")),
        }
    }

    let name = profile_name.ok_or_else(|| malformed("missing <synclog> element"))?;
    Ok(SyncLog::from_entries(name, entries))
}

fn result_from_attrs(e: &BytesStart<'_>) -> Result<SyncResults, XmlError> {
    let attrs = Attrs::parse(e)?;

    let parse_instant = |name: &str| -> Result<DateTime<Utc>, XmlError> {
        let raw = attrs.required(name, "result")?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| malformed(format!("invalid timestamp '{raw}'")))
    };

    let major = MajorCode::from_str(attrs.required("major", "result")?).map_err(malformed)?;
    let minor = MinorCode::from_str(attrs.required("minor", "result")?).map_err(malformed)?;

    Ok(SyncResults {
        start_time: parse_instant("start")?,
        end_time: parse_instant("end")?,
        major,
        minor,
        target_id: attrs.get("target").map(str::to_owned),
        scheduled: attrs.get("scheduled") == Some("true"),
    })
}

/// Render a sync log to its canonical document form.
pub fn write_log(log: &SyncLog) -> Result<String, XmlError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("synclog");
    root.push_attribute(("name", log.profile_name.as_str()));

    if log.entries().is_empty() {
        writer.write_event(Event::Empty(root))?;
    } else {
        writer.write_event(Event::Start(root))?;
        for result in log.entries() {
            let start = result.start_time.to_rfc3339();
            let end = result.end_time.to_rfc3339();
            let major = result.major.to_string();
            let minor = result.minor.to_string();

            let mut elem = BytesStart::new("result");
            elem.push_attribute(("start", start.as_str()));
            elem.push_attribute(("end", end.as_str()));
            elem.push_attribute(("major", major.as_str()));
            elem.push_attribute(("minor", minor.as_str()));
            elem.push_attribute(("scheduled", if result.scheduled { "true" } else { "false" }));
            if let Some(target) = &result.target_id {
                elem.push_attribute(("target", target.as_str()));
            }
            writer.write_event(Event::Empty(elem))?;
        }
        writer.write_event(Event::End(BytesEnd::new("synclog")))?;
    }

    String::from_utf8(writer.into_inner()).map_err(|e| malformed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_profile() -> Profile {
        let mut p = Profile::new("calendar", ProfileType::Sync);
        p.set_key("enabled", "true");
        p.set_key("destinationtype", "online");
        p.schedule = Some(SyncSchedule {
            enabled: true,
            days: [1u8, 2, 3, 4, 5].into_iter().collect(),
            start_time: NaiveTime::from_hms_opt(8, 0, 0),
            end_time: NaiveTime::from_hms_opt(20, 0, 0),
            interval_minutes: 30,
        });
        let mut client = Profile::new("caldav", ProfileType::Client);
        client.set_key("endpoint", "https://example.org/dav?a=1&b=2");
        p.sub_profiles.push(client);
        p.sub_profiles
            .push(Profile::new("contacts", ProfileType::Storage));
        p
    }

    #[test]
    fn profile_roundtrip() {
        let original = sample_profile();
        let doc = write_profile(&original).unwrap();
        let parsed = parse_profile(&doc).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn document_has_declaration_and_indent() {
        let doc = write_profile(&sample_profile()).unwrap();
        assert!(doc.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(doc.contains("\n    <key"), "children indented by 4 spaces");
    }

    #[test]
    fn attribute_values_are_escaped() {
        let doc = write_profile(&sample_profile()).unwrap();
        assert!(doc.contains("a=1&amp;b=2"));
        let parsed = parse_profile(&doc).unwrap();
        assert_eq!(
            parsed
                .sub_profile("caldav", Some(ProfileType::Client))
                .unwrap()
                .key("endpoint"),
            Some("https://example.org/dav?a=1&b=2")
        );
    }

    #[test]
    fn childless_profile_is_self_closing_and_roundtrips() {
        let p = Profile::new("empty", ProfileType::Client);
        let doc = write_profile(&p).unwrap();
        assert!(doc.contains("<profile name=\"empty\" type=\"client\"/>"));
        assert_eq!(parse_profile(&doc).unwrap(), p);
    }

    #[test]
    fn parse_rejects_unknown_elements() {
        let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<profile name="p" type="sync"><bogus/></profile>"#;
        assert!(parse_profile(doc).is_err());
    }

    #[test]
    fn parse_rejects_missing_attributes() {
        assert!(parse_profile(r#"<profile name="p"/>"#).is_err());
        assert!(parse_profile(r#"<profile type="sync"/>"#).is_err());
        assert!(parse_profile(r#"<profile name="p" type="nope"/>"#).is_err());
    }

    #[test]
    fn schedule_outside_sync_root_is_rejected() {
        let doc = r#"<profile name="p" type="sync">
    <profile name="c" type="client"><schedule enabled="true" interval="5"/></profile>
</profile>"#;
        assert!(parse_profile(doc).is_err());
    }

    #[test]
    fn log_roundtrip() {
        let mut log = SyncLog::new("calendar");
        let start = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        let mut ok = SyncResults::new(start, MajorCode::Success, MinorCode::NoError);
        ok.end_time = start + chrono::Duration::seconds(42);
        ok.target_id = Some("remote-1".to_owned());
        ok.scheduled = true;
        log.add_results(ok);
        log.add_results(SyncResults::new(
            start + chrono::Duration::hours(1),
            MajorCode::Failed,
            MinorCode::ConnectionError,
        ));

        let doc = write_log(&log).unwrap();
        let parsed = parse_log(&doc).unwrap();
        assert_eq!(parsed, log);
    }

    #[test]
    fn empty_log_roundtrips() {
        let log = SyncLog::new("quiet");
        let parsed = parse_log(&write_log(&log).unwrap()).unwrap();
        assert_eq!(parsed, log);
    }
}
