use crate::identity::{im_address, unique_id, ImAddress, ADDRESS_SCHEME};

#[test]
fn unique_id_is_pure_function_of_inputs() {
    assert_eq!(unique_id("acct/1", "bob"), unique_id("acct/1", "bob"));
    assert_ne!(unique_id("acct/1", "bob"), unique_id("acct/2", "bob"));
    assert_ne!(unique_id("acct/1", "bob"), unique_id("acct/1", "alice"));
}

#[test]
fn separator_keeps_inputs_apart() {
    assert_ne!(unique_id("acct/1", "bob"), unique_id("acct/1b", "ob"));
    assert_ne!(unique_id("a", "b!c"), unique_id("a!b", "c"));
}

#[test]
fn address_formats_and_parses() {
    let address = im_address("acct/1", "bob@example.org");
    assert_eq!(address.scheme(), ADDRESS_SCHEME);
    assert_eq!(address.to_string(), "imaddress:acct/1!bob@example.org");

    let parsed = ImAddress::parse("imaddress:acct/1!bob@example.org").expect("parse");
    assert_eq!(parsed, address);
    assert_eq!(parsed.account_path(), "acct/1");
    assert_eq!(parsed.protocol_id(), "bob@example.org");
    assert_eq!(parsed.unique_id(), unique_id("acct/1", "bob@example.org"));
}

#[test]
fn contact_ids_may_contain_the_separator() {
    let parsed = ImAddress::parse("imaddress:acct/1!odd!id").expect("parse");
    assert_eq!(parsed.account_path(), "acct/1");
    assert_eq!(parsed.protocol_id(), "odd!id");
}

#[test]
fn malformed_addresses_are_rejected() {
    assert!(ImAddress::parse("mailto:acct/1!bob").is_none());
    assert!(ImAddress::parse("imaddress:acct/1").is_none());
    assert!(ImAddress::parse("imaddress:!bob").is_none());
    assert!(ImAddress::parse("imaddress:acct/1!").is_none());
}
