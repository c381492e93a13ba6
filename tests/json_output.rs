//! JSON renderer output semantics.

use ipfix_parser::json::{JsonBuffer, JsonFlags, record_to_json};
use ipfix_parser::record::DataRecord;
use ipfix_parser::template::{Template, TemplateType};
use ipfix_parser::template_mgr::{SessionType, Snapshot, TemplateManager};
use ipfix_parser::{ErrorKind, IeManager};

use std::sync::Arc;

fn definitions() -> IeManager {
    let doc = r#"<ipfix-elements>
      <scope><pen>0</pen><name>iana</name>
        <element><id>1</id><name>octetDeltaCount</name><dataType>unsigned64</dataType></element>
        <element><id>7</id><name>sourceTransportPort</name><dataType>unsigned16</dataType></element>
        <element><id>8</id><name>sourceIPv4Address</name><dataType>ipv4Address</dataType></element>
        <element><id>56</id><name>sourceMacAddress</name><dataType>macAddress</dataType></element>
        <element><id>80</id><name>interfaceName</name><dataType>string</dataType></element>
        <element><id>276</id><name>absoluteError</name><dataType>float64</dataType></element>
        <element><id>277</id><name>relativeError</name><dataType>float32</dataType></element>
        <element><id>278</id><name>samplingFlag</name><dataType>boolean</dataType></element>
        <element><id>291</id><name>basicList</name><dataType>basicList</dataType></element>
        <element><id>292</id><name>subTemplateList</name><dataType>subTemplateList</dataType></element>
        <element><id>293</id><name>subTemplateMultiList</name><dataType>subTemplateMultiList</dataType></element>
        <element><id>300</id><name>payload</name><dataType>octetArray</dataType></element>
      </scope>
    </ipfix-elements>"#;

    let mut mgr = IeManager::new();
    mgr.load_elements_str(doc, false).unwrap();
    mgr
}

fn template_bytes(id: u16, fields: &[(u16, u16)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&(fields.len() as u16).to_be_bytes());
    for (fid, len) in fields {
        buf.extend_from_slice(&fid.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
    }
    buf
}

/// Template manager with definitions attached, returning the snapshot over
/// the given templates.
fn snapshot_with(iemgr: &IeManager, templates: &[(u16, &[(u16, u16)])]) -> Snapshot {
    let mut mgr = TemplateManager::new(SessionType::Udp);
    mgr.set_iemgr(Some(Arc::new(iemgr.copy())));
    mgr.set_time(100).unwrap();
    for (id, fields) in templates {
        let (tmplt, _) =
            Template::parse(TemplateType::Data, &template_bytes(*id, fields)).unwrap();
        mgr.template_add(tmplt).unwrap();
    }
    mgr.snapshot_get().unwrap()
}

fn render(record: &DataRecord, flags: JsonFlags, iemgr: Option<&IeManager>) -> String {
    let mut buf = JsonBuffer::growable();
    record_to_json(record, flags, iemgr, &mut buf).unwrap();
    let text = buf.into_string();
    // Every render must be strict JSON.
    serde_json::from_str::<serde_json::Value>(&text).unwrap();
    text
}

#[test]
fn string_escaping_rules() {
    let iemgr = definitions();
    let snapshot = snapshot_with(&iemgr, &[(256, &[(80, 65535)])]);
    let tmplt = snapshot.get(256).unwrap().clone();

    let payload = b"say \"hi\"\\\n\x01tail";
    let mut data = vec![payload.len() as u8];
    data.extend_from_slice(payload);

    let rec = DataRecord::new(&data, tmplt.clone(), Some(snapshot.clone())).unwrap();
    let text = render(&rec, JsonFlags::empty(), Some(&iemgr));
    assert!(text.contains(r#""iana:interfaceName":"say \"hi\"\\\n\u0001tail""#));

    // NON_PRINTABLE drops the control characters entirely.
    let text = render(&rec, JsonFlags::NON_PRINTABLE, Some(&iemgr));
    assert!(text.contains(r#""iana:interfaceName":"say \"hi\"\\tail""#));

    // An isolated invalid byte becomes U+FFFD.
    let data = [3, b'a', 0xFF, b'b'];
    let rec = DataRecord::new(&data, tmplt, Some(snapshot)).unwrap();
    let text = render(&rec, JsonFlags::empty(), Some(&iemgr));
    assert!(text.contains("a\u{FFFD}b"));
}

#[test]
fn numeric_and_float_values() {
    let iemgr = definitions();
    let snapshot = snapshot_with(&iemgr, &[(256, &[(276, 8), (277, 4), (278, 1)])]);
    let tmplt = snapshot.get(256).unwrap().clone();

    let mut data = Vec::new();
    data.extend_from_slice(&0.25f64.to_be_bytes());
    data.extend_from_slice(&std::f32::consts::PI.to_be_bytes());
    data.push(1);

    let rec = DataRecord::new(&data, tmplt.clone(), None).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&render(&rec, JsonFlags::empty(), Some(&iemgr))).unwrap();
    assert_eq!(value["iana:absoluteError"], 0.25);
    assert_eq!(value["iana:relativeError"], 3.14159);
    assert_eq!(value["iana:samplingFlag"], true);

    // Non-finite floats render as quoted strings.
    let mut data = Vec::new();
    data.extend_from_slice(&f64::INFINITY.to_be_bytes());
    data.extend_from_slice(&f32::NAN.to_be_bytes());
    data.push(2);
    let rec = DataRecord::new(&data, tmplt.clone(), None).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&render(&rec, JsonFlags::empty(), Some(&iemgr))).unwrap();
    assert_eq!(value["iana:absoluteError"], "Infinity");
    assert_eq!(value["iana:relativeError"], "NaN");
    assert_eq!(value["iana:samplingFlag"], false);

    // An invalid boolean degrades to null, other fields are unaffected.
    let mut data = Vec::new();
    data.extend_from_slice(&(-1.0f64).to_be_bytes());
    data.extend_from_slice(&f32::NEG_INFINITY.to_be_bytes());
    data.push(77);
    let rec = DataRecord::new(&data, tmplt, None).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&render(&rec, JsonFlags::empty(), Some(&iemgr))).unwrap();
    assert_eq!(value["iana:samplingFlag"], serde_json::Value::Null);
    assert_eq!(value["iana:relativeError"], "-Infinity");
    assert_eq!(value["iana:absoluteError"], -1.0);
}

#[test]
fn octet_arrays_and_macs() {
    let iemgr = definitions();
    let snapshot = snapshot_with(&iemgr, &[(256, &[(300, 4), (56, 6)])]);
    let tmplt = snapshot.get(256).unwrap().clone();

    let data = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x1B, 0x44, 0x11, 0x3A, 0xB7];
    let rec = DataRecord::new(&data, tmplt, None).unwrap();

    // Short octetArray renders as an unsigned integer by default.
    let value: serde_json::Value =
        serde_json::from_str(&render(&rec, JsonFlags::empty(), Some(&iemgr))).unwrap();
    assert_eq!(value["iana:payload"], 0xDEAD_BEEFu64);
    assert_eq!(value["iana:sourceMacAddress"], "00:1b:44:11:3a:b7");

    // OCTETS_NOINT forces the hexadecimal form.
    let value: serde_json::Value =
        serde_json::from_str(&render(&rec, JsonFlags::OCTETS_NOINT, Some(&iemgr))).unwrap();
    assert_eq!(
        value["iana:payload"],
        format!("0x{}", hex::encode([0xDE, 0xAD, 0xBE, 0xEF]))
    );
}

#[test]
fn multi_ie_fields_collect_into_array() {
    let iemgr = definitions();
    let snapshot = snapshot_with(&iemgr, &[(256, &[(1, 8), (7, 2), (1, 8)])]);
    let tmplt = snapshot.get(256).unwrap().clone();

    let mut data = Vec::new();
    data.extend_from_slice(&10u64.to_be_bytes());
    data.extend_from_slice(&80u16.to_be_bytes());
    data.extend_from_slice(&20u64.to_be_bytes());

    let rec = DataRecord::new(&data, tmplt, None).unwrap();
    let text = render(&rec, JsonFlags::empty(), Some(&iemgr));
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();

    assert_eq!(value["iana:octetDeltaCount"], serde_json::json!([10, 20]));
    assert_eq!(value["iana:sourceTransportPort"], 80);
    // The repeated IE appears exactly once.
    assert_eq!(text.matches("octetDeltaCount").count(), 1);
}

#[test]
fn basic_list_rendering() {
    let iemgr = definitions();
    let snapshot = snapshot_with(&iemgr, &[(256, &[(291, 65535)])]);
    let tmplt = snapshot.get(256).unwrap().clone();

    // basicList of three sourceTransportPort values, semantic allOf.
    let mut list = vec![3, 0, 7, 0, 2];
    for port in [80u16, 443, 8080] {
        list.extend_from_slice(&port.to_be_bytes());
    }

    let mut data = vec![list.len() as u8];
    data.extend_from_slice(&list);

    let rec = DataRecord::new(&data, tmplt, Some(snapshot)).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&render(&rec, JsonFlags::empty(), Some(&iemgr))).unwrap();

    let blist = &value["iana:basicList"];
    assert_eq!(blist["@type"], "basicList");
    assert_eq!(blist["semantic"], "allOf");
    assert_eq!(blist["fieldID"], "iana:sourceTransportPort");
    assert_eq!(blist["data"], serde_json::json!([80, 443, 8080]));
}

#[test]
fn sub_template_list_rendering() {
    let iemgr = definitions();
    let snapshot = snapshot_with(&iemgr, &[(256, &[(292, 65535)]), (257, &[(7, 2), (1, 8)])]);
    let tmplt = snapshot.get(256).unwrap().clone();

    let mut list = vec![4]; // ordered
    list.extend_from_slice(&257u16.to_be_bytes());
    list.extend_from_slice(&80u16.to_be_bytes());
    list.extend_from_slice(&1000u64.to_be_bytes());
    list.extend_from_slice(&443u16.to_be_bytes());
    list.extend_from_slice(&2000u64.to_be_bytes());

    let mut data = vec![list.len() as u8];
    data.extend_from_slice(&list);

    let rec = DataRecord::new(&data, tmplt, Some(snapshot)).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&render(&rec, JsonFlags::empty(), Some(&iemgr))).unwrap();

    let stlist = &value["iana:subTemplateList"];
    assert_eq!(stlist["@type"], "subTemplateList");
    assert_eq!(stlist["semantic"], "ordered");
    assert_eq!(stlist["data"][0]["iana:sourceTransportPort"], 80);
    assert_eq!(stlist["data"][1]["iana:octetDeltaCount"], 2000);
}

#[test]
fn sub_template_multilist_rendering() {
    let iemgr = definitions();
    let snapshot = snapshot_with(
        &iemgr,
        &[(256, &[(293, 65535)]), (257, &[(7, 2)]), (258, &[(1, 8)])],
    );
    let tmplt = snapshot.get(256).unwrap().clone();

    let mut list = vec![3]; // allOf
    // Block 1: template 257, two records.
    list.extend_from_slice(&257u16.to_be_bytes());
    list.extend_from_slice(&8u16.to_be_bytes());
    list.extend_from_slice(&80u16.to_be_bytes());
    list.extend_from_slice(&443u16.to_be_bytes());
    // Block 2: template 258, one record.
    list.extend_from_slice(&258u16.to_be_bytes());
    list.extend_from_slice(&12u16.to_be_bytes());
    list.extend_from_slice(&7777u64.to_be_bytes());

    let mut data = vec![list.len() as u8];
    data.extend_from_slice(&list);

    let rec = DataRecord::new(&data, tmplt, Some(snapshot)).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&render(&rec, JsonFlags::empty(), Some(&iemgr))).unwrap();

    let stm = &value["iana:subTemplateMultiList"];
    assert_eq!(stm["@type"], "subTemplateMultiList");
    assert_eq!(stm["semantic"], "allOf");
    // Outer array over blocks, inner over records.
    assert_eq!(stm["data"][0][0]["iana:sourceTransportPort"], 80);
    assert_eq!(stm["data"][0][1]["iana:sourceTransportPort"], 443);
    assert_eq!(stm["data"][1][0]["iana:octetDeltaCount"], 7777);
}

#[test]
fn malformed_list_degrades_to_null() {
    let iemgr = definitions();
    let snapshot = snapshot_with(&iemgr, &[(256, &[(291, 65535), (7, 2)])]);
    let tmplt = snapshot.get(256).unwrap().clone();

    // basicList whose declared element length overruns the list body.
    let list = [0u8, 0, 7, 0, 50, 1, 2, 3];
    let mut data = vec![list.len() as u8];
    data.extend_from_slice(&list);
    data.extend_from_slice(&99u16.to_be_bytes());

    let rec = DataRecord::new(&data, tmplt, Some(snapshot)).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&render(&rec, JsonFlags::empty(), Some(&iemgr))).unwrap();

    assert_eq!(value["iana:basicList"], serde_json::Value::Null);
    assert_eq!(value["iana:sourceTransportPort"], 99);
}

#[test]
fn fixed_buffer_reports_exhaustion() {
    let iemgr = definitions();
    let snapshot = snapshot_with(&iemgr, &[(256, &[(1, 8)])]);
    let tmplt = snapshot.get(256).unwrap().clone();

    let data = 123_456u64.to_be_bytes();
    let rec = DataRecord::new(&data, tmplt, None).unwrap();

    let mut buf = JsonBuffer::fixed(16);
    let err = record_to_json(&rec, JsonFlags::empty(), Some(&iemgr), &mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientBuffer);
    // The failed render leaves the buffer as it was.
    assert!(buf.is_empty());

    let mut buf = JsonBuffer::fixed(4096);
    let written = record_to_json(&rec, JsonFlags::empty(), Some(&iemgr), &mut buf).unwrap();
    assert_eq!(written, buf.len());
}

#[test]
fn unknown_fields_without_manager() {
    let snapshot = {
        let mut mgr = TemplateManager::new(SessionType::Udp);
        mgr.set_time(100).unwrap();
        let (tmplt, _) =
            Template::parse(TemplateType::Data, &template_bytes(256, &[(7, 2)])).unwrap();
        mgr.template_add(tmplt).unwrap();
        mgr.snapshot_get().unwrap()
    };
    let tmplt = snapshot.get(256).unwrap().clone();

    let data = 80u16.to_be_bytes();
    let rec = DataRecord::new(&data, tmplt, None).unwrap();

    let value: serde_json::Value =
        serde_json::from_str(&render(&rec, JsonFlags::empty(), None)).unwrap();
    assert_eq!(value["en0:id7"], 80);

    // IGNORE_UNKNOWN drops the field and leaves only the envelope.
    let text = render(&rec, JsonFlags::IGNORE_UNKNOWN, None);
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value.as_object().unwrap().len(), 1);
    assert_eq!(value["@type"], "ipfix.entry");
}
