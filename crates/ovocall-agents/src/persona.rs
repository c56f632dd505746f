//! Persona normalization and incremental supplement merging.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use ovocall_common::{is_mobile_number, normalize_id};
use rand::Rng;
use regex::Regex;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::text::{
    clean, first_present, first_truthy, is_truthy, normalize_long, normalize_short, value_text,
};

pub const SUPPLEMENT_KEY_CAP: usize = 40;
pub const SUPPLEMENT_VALUE_CAP: usize = 200;

const DEFAULT_GENDER: &str = "unisex";
const DEFAULT_AGE: &str = "未知";

static SUPPLEMENT_DELIMITER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("[:：=]").expect("supplement delimiter regex should compile")
});

/// The generated identity of a conversation counterpart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersonaProfile {
    pub name: String,
    /// Always an 11-digit number starting with `1` once normalized.
    pub phone_number: String,
    pub gender: String,
    pub age: String,
    pub birth_date: String,
    pub profession: String,
    pub appearance: String,
    pub public_personality: String,
    pub real_personality: String,
    pub self_statement: String,
    pub dark_side: String,
    pub values: String,
    pub habits: String,
    pub speech_style: String,
    pub relationship_goal: String,
    pub background: String,
    pub mmpages_display_name: String,
    pub mmpages_username: String,
    pub mmpages_bio: String,
    pub mmpages_bio_note: String,
    #[serde(alias = "personaSupplement", skip_serializing_if = "Supplements::is_empty")]
    pub supplements: Supplements,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplementEntry {
    pub key: String,
    pub value: String,
}

impl SupplementEntry {
    /// Clean and cap both halves. `None` when either ends up empty.
    pub fn new(key: &str, value: &str) -> Option<Self> {
        let key = clean(key, SUPPLEMENT_KEY_CAP);
        let value = clean(value, SUPPLEMENT_VALUE_CAP);
        if key.is_empty() || value.is_empty() {
            None
        } else {
            Some(Self { key, value })
        }
    }
}

/// Insertion-ordered key to value overlay of discovered persona traits.
///
/// Writing an existing key replaces its value in place, so rendering order is the
/// order in which keys were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Supplements(Vec<(String, String)>);

impl Supplements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn insert(&mut self, key: String, value: String) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<SupplementEntry> for Supplements {
    fn from_iter<I: IntoIterator<Item = SupplementEntry>>(iter: I) -> Self {
        let mut supplements = Supplements::new();
        for entry in iter {
            supplements.insert(entry.key, entry.value);
        }
        supplements
    }
}

impl Serialize for Supplements {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Supplements {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SupplementsVisitor)
    }
}

/// Accepts a key to value map (the stored form) or a list in any shape
/// [`supplement_entries`] understands.
struct SupplementsVisitor;

impl<'de> Visitor<'de> for SupplementsVisitor {
    type Value = Supplements;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map or list of persona supplements")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut supplements = Supplements::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            if let Some(entry) = SupplementEntry::new(&key, &value_text(&value)) {
                supplements.insert(entry.key, entry.value);
            }
        }
        Ok(supplements)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = access.next_element::<Value>()? {
            items.push(item);
        }
        Ok(supplement_entries(Some(&Value::Array(items)))
            .into_iter()
            .collect())
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(split_pair(v).into_iter().collect())
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
        Ok(Supplements::new())
    }

    fn visit_none<E: serde::de::Error>(self) -> Result<Self::Value, E> {
        Ok(Supplements::new())
    }
}

/// Normalize a persona-like JSON object. `None` for anything that is not an object.
pub fn normalize_persona(raw: &Value) -> Option<PersonaProfile> {
    normalize_persona_with(raw, &mut rand::rng())
}

pub fn normalize_persona_with<R: Rng>(raw: &Value, rng: &mut R) -> Option<PersonaProfile> {
    if !raw.is_object() {
        return None;
    }
    let short = |keys: &[&str]| normalize_short(first_present(raw, keys));
    let long = |keys: &[&str]| normalize_long(first_present(raw, keys));
    let or_default = |value: String, default: &str| {
        if value.is_empty() { default.to_string() } else { value }
    };

    let raw_phone = first_present(raw, &["phoneNumber", "phone", "number"])
        .map(value_text)
        .unwrap_or_default();

    Some(PersonaProfile {
        name: short(&["name", "fullName", "displayName"]),
        phone_number: resolve_phone_number(&raw_phone, rng),
        gender: or_default(short(&["gender"]), DEFAULT_GENDER),
        age: or_default(short(&["age"]), DEFAULT_AGE),
        birth_date: short(&["birthDate", "birth", "birthday"]),
        profession: short(&["profession", "job"]),
        appearance: long(&["appearance"]),
        public_personality: long(&["publicPersonality", "public"]),
        real_personality: long(&["realPersonality", "real"]),
        self_statement: long(&["selfStatement", "statement", "selfIntro", "intro"]),
        dark_side: long(&["darkSide", "shadow", "flaw"]),
        values: long(&["values", "value"]),
        habits: long(&["habits", "habit"]),
        speech_style: long(&["speechStyle", "tone", "voice"]),
        relationship_goal: long(&["relationshipGoal", "relationship", "goal", "intention"]),
        background: long(&["background", "backstory", "story"]),
        mmpages_display_name: short(&["mmpagesDisplayName", "displayName"]),
        mmpages_username: short(&["mmpagesUsername", "username"]),
        mmpages_bio: long(&["mmpagesBio", "bio"]),
        mmpages_bio_note: long(&["mmpagesBioNote", "bioNote"]),
        supplements: first_present(raw, &["supplements", "personaSupplement"])
            .map(|s| supplement_entries(Some(s)).into_iter().collect())
            .unwrap_or_default(),
    })
}

/// Keep `raw` when it is a valid mobile number, otherwise synthesize one.
pub fn resolve_phone_number<R: Rng>(raw: &str, rng: &mut R) -> String {
    let cleaned = normalize_id(raw);
    if is_mobile_number(&cleaned) {
        cleaned
    } else {
        fallback_phone_number(rng)
    }
}

/// `1` followed by ten random digits.
pub fn fallback_phone_number<R: Rng>(rng: &mut R) -> String {
    format!("1{:010}", rng.random_range(0..10_000_000_000u64))
}

/// Split `key:value`, `key：value` or `key=value` at the first delimiter.
fn split_pair(text: &str) -> Option<SupplementEntry> {
    let mut parts = SUPPLEMENT_DELIMITER.splitn(text, 2);
    let key = parts.next().unwrap_or_default();
    let value = parts.next().unwrap_or_default();
    SupplementEntry::new(key, value)
}

/// Read supplement entries from any shape the model produces: a list of
/// delimiter-separated strings, a list of `{key, value}`-like objects, a single
/// such object, a plain key to value object, or one delimited string.
pub fn supplement_entries(raw: Option<&Value>) -> Vec<SupplementEntry> {
    let Some(raw) = raw.filter(|v| is_truthy(v)) else {
        return Vec::new();
    };

    let from_object = |item: &Value| {
        let key = first_truthy(item, &["key", "field", "name"]).map(value_text);
        let value = first_truthy(item, &["value", "text", "content"]).map(value_text);
        SupplementEntry::new(&key.unwrap_or_default(), &value.unwrap_or_default())
    };

    match raw {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => split_pair(s),
                Value::Object(_) => from_object(item),
                _ => None,
            })
            .collect(),
        Value::Object(map) => {
            if first_truthy(raw, &["key", "field"]).is_some() {
                from_object(raw).into_iter().collect()
            } else {
                map.iter()
                    .filter_map(|(k, v)| SupplementEntry::new(k, &value_text(v)))
                    .collect()
            }
        }
        Value::String(s) => split_pair(s).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Upsert `entries` into the persona's supplements. Returns the input untouched
/// (borrowed) when no entry survives cleaning.
pub fn merge_supplement<'a>(
    persona: &'a PersonaProfile,
    entries: &[SupplementEntry],
) -> Cow<'a, PersonaProfile> {
    let cleaned: Vec<SupplementEntry> = entries
        .iter()
        .filter_map(|e| SupplementEntry::new(&e.key, &e.value))
        .collect();
    if cleaned.is_empty() {
        return Cow::Borrowed(persona);
    }

    let mut merged = persona.clone();
    for entry in cleaned {
        merged.supplements.insert(entry.key, entry.value);
    }
    Cow::Owned(merged)
}

/// Bullet list of supplements in insertion order, for prompt context.
pub fn render_supplements(persona: &PersonaProfile) -> String {
    persona
        .supplements
        .iter()
        .map(|(k, v)| format!("- {k}：{v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    fn entry(key: &str, value: &str) -> SupplementEntry {
        SupplementEntry::new(key, value).unwrap()
    }

    #[test]
    fn aliases_and_defaults() {
        let persona = normalize_persona(&json!({
            "fullName": "苏晴",
            "phone": "138-0013-8000",
            "job": "插画师",
            "tone": "慢吞吞的",
            "backstory": "刚搬来这座城市",
            "username": "sunny_q",
        }))
        .unwrap();

        assert_eq!(persona.name, "苏晴");
        assert_eq!(persona.phone_number, "13800138000");
        assert_eq!(persona.gender, "unisex");
        assert_eq!(persona.age, "未知");
        assert_eq!(persona.profession, "插画师");
        assert_eq!(persona.speech_style, "慢吞吞的");
        assert_eq!(persona.background, "刚搬来这座城市");
        assert_eq!(persona.mmpages_username, "sunny_q");
    }

    #[test]
    fn missing_phone_is_synthesized() {
        let persona = normalize_persona(&json!({"name": "阿杰"})).unwrap();
        assert!(ovocall_common::is_mobile_number(&persona.phone_number));
    }

    #[test]
    fn invalid_phones_always_yield_mobile_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        for raw in [json!("12345"), json!(23800138000u64), json!("abc"), json!(null), json!("1380013800012")] {
            let persona = normalize_persona_with(&json!({"phoneNumber": raw}), &mut rng).unwrap();
            let phone = &persona.phone_number;
            assert_eq!(phone.len(), 11, "{phone}");
            assert!(phone.starts_with('1'));
            assert!(phone.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn seeded_fallback_is_reproducible() {
        let a = fallback_phone_number(&mut StdRng::seed_from_u64(42));
        let b = fallback_phone_number(&mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
        assert!(ovocall_common::is_mobile_number(&a));
    }

    #[test]
    fn fields_are_capped() {
        let long_name = "名".repeat(100);
        let long_bio = "x".repeat(500);
        let persona = normalize_persona(&json!({"name": long_name, "bio": long_bio})).unwrap();
        assert_eq!(persona.name.chars().count(), 60);
        assert_eq!(persona.mmpages_bio.chars().count(), 240);
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(normalize_persona(&json!("苏晴")).is_none());
        assert!(normalize_persona(&json!(null)).is_none());
        assert!(normalize_persona(&json!([{"name": "x"}])).is_none());
    }

    #[test]
    fn supplement_shapes() {
        assert_eq!(
            supplement_entries(Some(&json!(["爱好：爬山", "口头禅=随便啦", "无分隔", ""]))),
            vec![entry("爱好", "爬山"), entry("口头禅", "随便啦")]
        );
        assert_eq!(
            supplement_entries(Some(&json!([{"field": "宠物", "text": "一只橘猫"}, {"key": "", "value": "x"}]))),
            vec![entry("宠物", "一只橘猫")]
        );
        assert_eq!(
            supplement_entries(Some(&json!({"key": "星座", "content": "天蝎"}))),
            vec![entry("星座", "天蝎")]
        );
        assert_eq!(
            supplement_entries(Some(&json!({"血型": "O"}))),
            vec![entry("血型", "O")]
        );
        assert_eq!(
            supplement_entries(Some(&json!("时间: 10:30"))),
            vec![entry("时间", "10:30")]
        );
        assert!(supplement_entries(Some(&json!(""))).is_empty());
        assert!(supplement_entries(Some(&json!(12))).is_empty());
        assert!(supplement_entries(None).is_empty());
    }

    #[test]
    fn supplement_caps() {
        let e = SupplementEntry::new(&"k".repeat(50), &"v".repeat(300)).unwrap();
        assert_eq!(e.key.len(), 40);
        assert_eq!(e.value.len(), 200);
    }

    #[test]
    fn merge_upserts_and_keeps_unrelated_keys() {
        let mut persona = PersonaProfile::default();
        persona.supplements.insert("爱好".into(), "爬山".into());
        persona.supplements.insert("宠物".into(), "猫".into());

        let merged = merge_supplement(&persona, &[entry("宠物", "两只猫"), entry("星座", "天蝎")]);
        assert_eq!(merged.supplements.get("爱好"), Some("爬山"));
        assert_eq!(merged.supplements.get("宠物"), Some("两只猫"));
        assert_eq!(merged.supplements.get("星座"), Some("天蝎"));
        // input untouched
        assert_eq!(persona.supplements.get("宠物"), Some("猫"));
        assert_eq!(
            render_supplements(&merged),
            "- 爱好：爬山\n- 宠物：两只猫\n- 星座：天蝎"
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let persona = PersonaProfile::default();
        let entries = vec![entry("a", "1"), entry("b", "2"), entry("a", "3")];
        let once = merge_supplement(&persona, &entries).into_owned();
        let twice = merge_supplement(&once, &entries).into_owned();
        assert_eq!(once.supplements, twice.supplements);
        assert_eq!(once.supplements.get("a"), Some("3"));
    }

    #[test]
    fn empty_merge_borrows_the_original() {
        let persona = PersonaProfile::default();
        let bogus = SupplementEntry {
            key: "  ".into(),
            value: "x".into(),
        };
        assert!(matches!(merge_supplement(&persona, &[]), Cow::Borrowed(_)));
        assert!(matches!(merge_supplement(&persona, &[bogus]), Cow::Borrowed(_)));
    }

    #[test]
    fn stored_form_round_trips_through_serde() {
        let mut persona = normalize_persona(&json!({"name": "周", "phoneNumber": "13900001111"})).unwrap();
        persona.supplements.insert("z".into(), "last".into());
        persona.supplements.insert("a".into(), "first".into());

        let text = serde_json::to_string(&persona).unwrap();
        assert!(text.contains("\"phoneNumber\":\"13900001111\""));
        assert!(text.contains("\"mmpagesBioNote\""));

        let back: PersonaProfile = serde_json::from_str(&text).unwrap();
        assert_eq!(back, persona);
        assert_eq!(render_supplements(&back), "- z：last\n- a：first");

        let legacy: PersonaProfile =
            serde_json::from_str(r#"{"name":"周","personaSupplement":["口味：偏辣"]}"#).unwrap();
        assert_eq!(legacy.supplements.get("口味"), Some("偏辣"));
    }
}
