#![cfg(any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64"))]

use std::collections::{BTreeMap, HashMap};

use jitson::{Bytes, Config, Engine, Facet, Options};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, PartialEq, Facet, Serialize, Deserialize)]
#[facet(traits(Default))]
struct Address {
    city: String,
    zip: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Facet, Serialize, Deserialize)]
#[facet(traits(Default))]
struct Person {
    name: String,
    age: u32,
    address: Address,
    tags: Vec<String>,
    nickname: Option<String>,
    scores: [i16; 3],
    ratio: f64,
    active: bool,
    extra: BTreeMap<String, i64>,
    #[facet(recursive_type)]
    boss: Option<Box<Address>>,
}

fn alice() -> Person {
    Person {
        name: "Alice \"Al\" Liddell\n\u{1}".into(),
        age: 30,
        address: Address {
            city: "Zürich".into(),
            zip: 8001,
        },
        tags: vec!["admin".into(), "ops".into()],
        nickname: None,
        scores: [-7, 0, 32767],
        ratio: 0.25,
        active: true,
        extra: [("b".to_owned(), -1), ("a".to_owned(), i64::MAX)].into_iter().collect(),
        boss: Some(Box::new(Address {
            city: "Bern".into(),
            zip: 3000,
        })),
    }
}

#[test]
fn encode_matches_serde_json() {
    let engine = Engine::default();
    let person = alice();
    let ours = engine.encode(&person).unwrap();
    let theirs = serde_json::to_vec(&person).unwrap();
    assert_eq!(String::from_utf8(ours).unwrap(), String::from_utf8(theirs).unwrap());
}

#[test]
fn decode_reads_serde_json_output() {
    let engine = Engine::default();
    let person = alice();
    let json = serde_json::to_vec_pretty(&person).unwrap();
    let back: Person = engine.decode(&json).unwrap();
    assert_eq!(back, person);
}

#[test]
fn simple_struct_round_trip() {
    #[derive(Debug, Default, PartialEq, Facet)]
    #[facet(traits(Default))]
    struct User {
        name: String,
        age: u32,
    }

    let engine = Engine::default();
    let json = engine
        .encode(&User {
            name: "Alice".into(),
            age: 30,
        })
        .unwrap();
    assert_eq!(json, br#"{"name":"Alice","age":30}"#);
    let user: User = engine.decode(&json).unwrap();
    assert_eq!(user.name, "Alice");
    assert_eq!(user.age, 30);
}

#[test]
fn integer_extremes() {
    #[derive(Debug, Default, PartialEq, Facet, Serialize, Deserialize)]
    #[facet(traits(Default))]
    struct Ints {
        a: i8,
        b: i16,
        c: i32,
        d: i64,
        e: u8,
        f: u16,
        g: u32,
        h: u64,
    }

    let engine = Engine::default();
    for v in [
        Ints {
            a: i8::MIN,
            b: i16::MIN,
            c: i32::MIN,
            d: i64::MIN,
            e: u8::MAX,
            f: u16::MAX,
            g: u32::MAX,
            h: u64::MAX,
        },
        Ints::default(),
    ] {
        let json = engine.encode(&v).unwrap();
        assert_eq!(json, serde_json::to_vec(&v).unwrap());
        assert_eq!(engine.decode::<Ints>(&json).unwrap(), v);
    }
}

#[test]
fn whole_number_floats_keep_a_fraction() {
    let engine = Engine::default();
    assert_eq!(engine.encode(&1.0f64).unwrap(), b"1.0");
    assert_eq!(engine.encode(&-0.5f32).unwrap(), b"-0.5");
    assert_eq!(engine.decode::<f64>(b"2").unwrap(), 2.0);
    assert_eq!(engine.decode::<f32>(b" 1.5e1 ").unwrap(), 15.0);
}

#[test]
fn omit_empty_skips_zero_values() {
    #[derive(Debug, Default, PartialEq, Facet)]
    #[facet(traits(Default))]
    struct Sparse {
        #[facet(jitson::omit_empty)]
        id: u32,
        #[facet(jitson::omit_empty)]
        note: String,
        #[facet(jitson::omit_empty)]
        tags: Vec<u8>,
        #[facet(jitson::omit_empty)]
        parent: Option<u32>,
        name: String,
    }

    let engine = Engine::default();
    assert_eq!(engine.encode(&Sparse::default()).unwrap(), br#"{"name":""}"#);
    let full = Sparse {
        id: 3,
        note: "n".into(),
        tags: vec![1],
        parent: Some(0),
        name: "x".into(),
    };
    assert_eq!(
        engine.encode(&full).unwrap(),
        br#"{"id":3,"note":"n","tags":[1],"parent":0,"name":"x"}"#
    );
}

#[test]
fn omit_empty_leading_field_gets_no_stray_comma() {
    #[derive(Debug, Default, Facet)]
    #[facet(traits(Default))]
    struct Pair {
        #[facet(jitson::omit_empty)]
        first: u8,
        #[facet(jitson::omit_empty)]
        second: u8,
    }

    let engine = Engine::default();
    assert_eq!(engine.encode(&Pair { first: 0, second: 2 }).unwrap(), br#"{"second":2}"#);
    assert_eq!(engine.encode(&Pair { first: 1, second: 0 }).unwrap(), br#"{"first":1}"#);
    assert_eq!(engine.encode(&Pair::default()).unwrap(), b"{}");
}

#[test]
fn renamed_and_quoted_fields() {
    #[derive(Debug, Default, PartialEq, Facet)]
    #[facet(traits(Default))]
    struct Wire {
        #[facet(rename = "userId")]
        user_id: u64,
        #[facet(jitson::quoted)]
        count: i32,
        #[facet(skip)]
        hidden: u8,
    }

    let engine = Engine::default();
    let json = engine
        .encode(&Wire {
            user_id: 9,
            count: -4,
            hidden: 1,
        })
        .unwrap();
    assert_eq!(json, br#"{"userId":9,"count":"-4"}"#);
    let back: Wire = engine.decode(br#"{"count":"12","userId":1,"hidden":5}"#).unwrap();
    assert_eq!(
        back,
        Wire {
            user_id: 1,
            count: 12,
            hidden: 0
        }
    );
}

#[test]
fn field_names_fall_back_to_case_insensitive() {
    let engine = Engine::default();
    let a: Address = engine.decode(br#"{"CITY":"Oslo","Zip":150}"#).unwrap();
    assert_eq!(a.city, "Oslo");
    assert_eq!(a.zip, 150);

    let strict = engine
        .decode_with::<Address>(br#"{"CITY":"Oslo"}"#, Options::CASE_SENSITIVE | Options::VALIDATE_STRING)
        .unwrap();
    assert_eq!(strict.city, "");
}

#[test]
fn unknown_fields_are_skipped() {
    let engine = Engine::default();
    let a: Address = engine
        .decode(br#"{"x":{"deep":[1,2,{"y":null}]},"city":"Rome","z":"}","zip":1}"#)
        .unwrap();
    assert_eq!(
        a,
        Address {
            city: "Rome".into(),
            zip: 1
        }
    );
}

#[test]
fn null_handling() {
    let engine = Engine::default();
    let mut a = Address {
        city: "Keep".into(),
        zip: 5,
    };
    engine.decode_into(br#"{"city":null,"zip":null}"#, &mut a).unwrap();
    assert_eq!(a.city, "Keep");
    assert_eq!(a.zip, 5);

    let mut opt = Some(3u8);
    engine.decode_into(b"null", &mut opt).unwrap();
    assert_eq!(opt, None);
}

#[test]
fn arrays_keep_defaults_and_drop_extras() {
    let engine = Engine::default();
    assert_eq!(engine.decode::<[u8; 3]>(b"[1]").unwrap(), [1, 0, 0]);
    assert_eq!(engine.decode::<[u8; 2]>(b"[1,2,3,[4]]").unwrap(), [1, 2]);
    assert_eq!(engine.encode(&[[1u8, 2], [3, 4]]).unwrap(), b"[[1,2],[3,4]]");
    assert_eq!(engine.encode(&<[u8; 0]>::default()).unwrap(), b"[]");
}

#[test]
fn sequences_replace_existing_contents() {
    let engine = Engine::default();
    let mut v = vec![9u32, 9, 9];
    engine.decode_into(b"[ 1 , 2 ]", &mut v).unwrap();
    assert_eq!(v, [1, 2]);
    engine.decode_into(b"[]", &mut v).unwrap();
    assert!(v.is_empty());
    assert_eq!(engine.encode(&Vec::<u32>::new()).unwrap(), b"[]");
}

#[test]
fn nested_sequences() {
    let engine = Engine::default();
    let v: Vec<Vec<Option<i32>>> = engine.decode(b"[[1,null],[],[-3]]").unwrap();
    assert_eq!(v, vec![vec![Some(1), None], vec![], vec![Some(-3)]]);
    assert_eq!(engine.encode(&v).unwrap(), b"[[1,null],[],[-3]]");
}

#[test]
fn maps_round_trip() {
    let engine = Engine::default();
    let m: HashMap<String, Vec<u8>> = engine.decode(br#"{"a":[1],"b":[],"a":[2,3]}"#).unwrap();
    assert_eq!(m.len(), 2);
    assert_eq!(m["a"], [2, 3]);

    let sorted = engine.encode_with(&m, Options::SORT_MAP_KEYS).unwrap();
    assert_eq!(sorted, br#"{"a":[2,3],"b":[]}"#);

    let b: BTreeMap<String, String> = engine.decode(r#"{"kéy":"v"}"#.as_bytes()).unwrap();
    assert_eq!(engine.encode(&b).unwrap(), "{\"kéy\":\"v\"}".as_bytes());
}

#[test]
fn bytes_are_base64() {
    #[derive(Debug, Default, PartialEq, Facet)]
    #[facet(traits(Default))]
    struct Blob {
        data: Bytes,
    }

    let engine = Engine::default();
    let blob = Blob {
        data: Bytes(vec![0, 1, 2, 250]),
    };
    let json = engine.encode(&blob).unwrap();
    assert_eq!(json, br#"{"data":"AAEC+g=="}"#);
    assert_eq!(engine.decode::<Blob>(&json).unwrap(), blob);
}

#[test]
fn html_escaping_is_optional() {
    let engine = Engine::default();
    let s = String::from("<a&b>");
    assert_eq!(engine.encode(&s).unwrap(), br#""<a&b>""#);
    assert_eq!(
        engine.encode_with(&s, Options::ESCAPE_HTML).unwrap(),
        br#""\u003ca\u0026b\u003e""#
    );
}

#[test]
fn escapes_decode() {
    let engine = Engine::default();
    let s: String = engine.decode(r#""tab\there \"q\" 😀 \/""#.as_bytes()).unwrap();
    assert_eq!(s, "tab\there \"q\" \u{1F600} /");
}

#[test]
fn recursive_types() {
    #[derive(Debug, Default, PartialEq, Facet, Serialize, Deserialize)]
    #[facet(traits(Default))]
    struct Tree {
        label: String,
        #[facet(recursive_type)]
        kids: Vec<Tree>,
    }

    fn build(depth: u32) -> Tree {
        Tree {
            label: format!("d{depth}"),
            kids: if depth == 0 {
                vec![]
            } else {
                vec![build(depth - 1), build(depth - 1)]
            },
        }
    }

    let engine = Engine::default();
    let tree = build(6);
    let json = engine.encode(&tree).unwrap();
    assert_eq!(json, serde_json::to_vec(&tree).unwrap());
    assert_eq!(engine.decode::<Tree>(&json).unwrap(), tree);

    // The self-reference is a cycle, not nesting, so a tight limit still compiles.
    let tight = Engine::new(Config::builder().max_depth(2).build());
    let leaf = Tree {
        label: "x".into(),
        kids: vec![],
    };
    assert_eq!(tight.encode(&leaf).unwrap(), br#"{"label":"x","kids":[]}"#);
    assert_eq!(tight.decode::<Tree>(br#"{"label":"x","kids":[]}"#).unwrap(), leaf);
}

#[test]
fn output_buffer_grows_past_initial_capacity() {
    let engine = Engine::new(Config::builder().initial_buffer(16).build());
    let roomy = Engine::new(Config::builder().initial_buffer(1 << 20).build());
    let v: Vec<String> = (0..500).map(|i| format!("item number {i}")).collect();
    let json = engine.encode(&v).unwrap();
    assert_eq!(json, serde_json::to_vec(&v).unwrap());
    assert!(json.len() > 16);
    // Growing mid-routine must not change a single byte.
    assert_eq!(json, roomy.encode(&v).unwrap());
}

#[test]
fn deep_inline_nesting_matches_recursion() {
    type Deep = Vec<Vec<Vec<Vec<Vec<Vec<Vec<Vec<Vec<Vec<u8>>>>>>>>>>;
    let engine = Engine::new(Config::builder().max_inline_depth(2).build());
    let json = b"[[[[[[[[[[7]]]]]]]]]]";
    let v: Deep = engine.decode(json).unwrap();
    assert_eq!(engine.encode(&v).unwrap(), json);
    assert!(engine.cache_stats().compilations > 2);
}

#[test]
fn flattened_fields_share_the_object() {
    #[derive(Debug, Default, PartialEq, Facet)]
    #[facet(traits(Default))]
    struct Meta {
        version: u8,
    }

    #[derive(Debug, Default, PartialEq, Facet)]
    #[facet(traits(Default))]
    struct Doc {
        title: String,
        #[facet(flatten)]
        meta: Meta,
    }

    let engine = Engine::default();
    let doc = Doc {
        title: "t".into(),
        meta: Meta { version: 2 },
    };
    let json = engine.encode(&doc).unwrap();
    assert_eq!(json, br#"{"title":"t","version":2}"#);
    assert_eq!(engine.decode::<Doc>(&json).unwrap(), doc);
}

#[derive(Debug, Default, Clone, PartialEq, Facet, Serialize, Deserialize)]
#[facet(traits(Default))]
struct Inner {
    flag: bool,
    small: i8,
    label: String,
}

#[derive(Debug, Default, Clone, PartialEq, Facet, Serialize, Deserialize)]
#[facet(traits(Default))]
struct Record {
    id: u64,
    delta: i32,
    ratio: f64,
    name: String,
    samples: Vec<u16>,
    maybe: Option<i64>,
    lookup: BTreeMap<String, u32>,
    inner: Inner,
    children: Vec<Inner>,
    spare: Option<Inner>,
}

fn text() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => any::<String>(),
        1 => r#"[a-z\\"\n\t/]{0,8}"#.prop_map(String::from),
    ]
}

fn inner() -> impl Strategy<Value = Inner> {
    (any::<bool>(), any::<i8>(), text()).prop_map(|(flag, small, label)| Inner { flag, small, label })
}

prop_compose! {
    fn record()(
        id in any::<u64>(),
        delta in any::<i32>(),
        ratio in (-1_000_000i32..1_000_000).prop_map(|n| f64::from(n) / 64.0),
        name in text(),
        samples in prop::collection::vec(any::<u16>(), 0..8),
        maybe in prop::option::of(any::<i64>()),
        lookup in prop::collection::btree_map(text(), any::<u32>(), 0..4),
        inner in inner(),
        children in prop::collection::vec(inner(), 0..3),
        spare in prop::option::of(inner()),
    ) -> Record {
        Record { id, delta, ratio, name, samples, maybe, lookup, inner, children, spare }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn records_round_trip_and_agree_with_serde_json(v in record()) {
        let engine = Engine::default();
        let ours = engine.encode(&v).unwrap();
        prop_assert_eq!(&engine.decode::<Record>(&ours).unwrap(), &v);
        prop_assert_eq!(&serde_json::from_slice::<Record>(&ours).unwrap(), &v);

        let theirs = serde_json::to_vec(&v).unwrap();
        prop_assert_eq!(&engine.decode::<Record>(&theirs).unwrap(), &v);
    }

    #[test]
    fn scalars_round_trip(a in any::<i64>(), b in any::<usize>(), c in any::<bool>(), s in text()) {
        let engine = Engine::default();
        prop_assert_eq!(engine.decode::<i64>(&engine.encode(&a).unwrap()).unwrap(), a);
        prop_assert_eq!(engine.decode::<usize>(&engine.encode(&b).unwrap()).unwrap(), b);
        prop_assert_eq!(engine.decode::<bool>(&engine.encode(&c).unwrap()).unwrap(), c);
        let json = engine.encode(&s).unwrap();
        prop_assert_eq!(&serde_json::from_slice::<String>(&json).unwrap(), &s);
        prop_assert_eq!(&engine.decode::<String>(&json).unwrap(), &s);
    }
}
