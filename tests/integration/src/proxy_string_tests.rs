//! Proxy String Tests - stringification is stable
//!
//! For any proxy, `to_proxy_string` read back with `string_to_proxy`
//! yields an equal proxy, and stringifying that one again yields the
//! same text.

mod common;

use proptest::prelude::*;

use common::*;
use floe::{Communicator, Identity};

fn name_strategy() -> impl Strategy<Value = String> {
    // printable text including the characters that need quoting or escaping
    proptest::string::string_regex("[a-zA-Z0-9_][a-zA-Z0-9 _:@/\\\\\"'.-]{0,11}").unwrap()
}

fn endpoint_strategy() -> impl Strategy<Value = String> {
    let host = prop_oneof![
        Just("127.0.0.1".to_string()),
        Just("localhost".to_string()),
        Just("example.com".to_string()),
    ];
    let transport = prop_oneof![Just("tcp"), Just("udp"), Just("ssl")];
    let timeout = prop_oneof![
        Just(String::new()),
        Just(" -t 500".to_string()),
        Just(" -t infinite".to_string()),
    ];
    (transport, host, 1u16..65535, timeout, any::<bool>()).prop_map(
        |(transport, host, port, timeout, compress)| {
            let timeout = if transport == "udp" { String::new() } else { timeout };
            format!(
                "{} -h {} -p {}{}{}",
                transport,
                host,
                port,
                timeout,
                if compress { " -z" } else { "" }
            )
        },
    )
}

fn mode_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("-t"), Just("-o"), Just("-O"), Just("-d")]
}

fn roundtrip(communicator: &Communicator, input: &str) {
    let proxy = communicator.string_to_proxy(input).unwrap();
    let text = proxy.to_proxy_string().unwrap();
    let reparsed = communicator.string_to_proxy(&text).unwrap();
    assert_eq!(reparsed, proxy, "`{}` -> `{}`", input, text);
    assert_eq!(reparsed.to_proxy_string().unwrap(), text);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn direct_proxies_roundtrip(
        category in proptest::option::of(name_strategy()),
        name in name_strategy(),
        facet in proptest::option::of(name_strategy()),
        mode in mode_strategy(),
        secure in any::<bool>(),
        endpoints in proptest::collection::vec(endpoint_strategy(), 1..4),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let communicator = Communicator::new().unwrap();

        let identity = Identity::new(category.unwrap_or_default(), name);
        let mut proxy = communicator
            .string_to_proxy(&format!("placeholder {}:{}", mode, endpoints.join(":")))
            .unwrap()
            .with_identity(identity.clone())
            .with_secure(secure);
        if let Some(facet) = facet {
            proxy = proxy.with_facet(facet);
        }
        let text = proxy.to_proxy_string().unwrap();
        roundtrip(&communicator, &text);
        let parsed = communicator.string_to_proxy(&text).unwrap();
        prop_assert_eq!(parsed.identity(), &identity);
    }

    #[test]
    fn indirect_proxies_roundtrip(
        name in name_strategy(),
        adapter_id in name_strategy(),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let communicator = Communicator::new().unwrap();

        let proxy = communicator
            .string_to_proxy("placeholder")
            .unwrap()
            .with_identity(Identity::named(name))
            .with_adapter_id(Some(&adapter_id));
        let text = proxy.to_proxy_string().unwrap();
        roundtrip(&communicator, &text);
        let parsed = communicator.string_to_proxy(&text).unwrap();
        prop_assert_eq!(
            parsed.adapter_id(),
            Some(adapter_id.as_str())
        );
    }
}

#[test]
fn test_known_forms() {
    init_logging();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();
    let communicator = Communicator::new().unwrap();

    for input in [
        "test:tcp -h localhost -p 4061",
        "test -f facet -o:tcp -h localhost -p 4061 -t 1000:udp -h localhost -p 4062",
        "cat/name -s:ssl -h example.com -p 443",
        "\"with space\" @ \"adapter id\"",
        "plain",
    ] {
        roundtrip(&communicator, input);
    }
}
