mod common;

use common::*;
use glass_pilot::error::StepErrorKind;
use glass_pilot::selector::{Descriptor, SelectorChain, SelectorResolver};
use std::time::Duration;

fn css(s: &str) -> Descriptor {
    Descriptor::Css { selector: s.into() }
}

fn chain_of(el: &FakeElement) -> SelectorChain {
    SelectorChain::for_element(&el.tag, &role_of(el), &el.text, &el.attributes)
}

fn role_of(el: &FakeElement) -> String {
    glass_pilot::model::normalize_role(&el.tag, &el.attributes)
}

fn distinct(queries: &[Descriptor]) -> Vec<Descriptor> {
    let mut out: Vec<Descriptor> = Vec::new();
    for q in queries {
        if !out.contains(q) {
            out.push(q.clone());
        }
    }
    out
}

#[tokio::test]
async fn primary_match_attempts_no_fallback() {
    let button = FakeElement::new("button", "Apply", &[("data-testid", "apply"), ("id", "apply-now")]);
    let chain = chain_of(&button);
    assert_eq!(chain.len(), 3);
    let page = FakePage::new(Screen::new(HOME_URL, "Example", "", vec![button]));
    let resolver = SelectorResolver::new(&page, fast_config().resolver);

    let target = resolver.resolve_default(&chain).await.unwrap();

    assert_eq!(target.rank, 0);
    assert!(!target.used_fallback());
    assert_eq!(page.queries(), vec![chain.primary.clone()]);
}

#[tokio::test]
async fn exhausted_chain_tries_every_descriptor_in_order() {
    let chain = SelectorChain::new(css("#a"), vec![css("#b"), css("#c"), css("#d")]);
    let page = FakePage::new(Screen::new(HOME_URL, "Example", "", vec![]));
    let resolver = SelectorResolver::new(&page, fast_config().resolver);

    let err = resolver.resolve(&chain, Duration::from_millis(30)).await.unwrap_err();

    assert_eq!(err.kind(), StepErrorKind::NotFound);
    assert_eq!(distinct(&page.queries()), vec![css("#a"), css("#b"), css("#c"), css("#d")]);
}

#[tokio::test]
async fn hidden_and_disabled_matches_are_rejected() {
    let hidden = FakeElement::new("a", "Jobs", &[("data-css", "#jobs")]).hidden();
    let disabled = FakeElement::new("button", "Send", &[("data-css", "#send")]).disabled();
    let disabled_link = FakeElement::new("a", "Docs", &[("data-css", "#docs")]).disabled();
    let page = FakePage::new(Screen::new(HOME_URL, "Example", "", vec![hidden, disabled, disabled_link]));
    let resolver = SelectorResolver::new(&page, fast_config().resolver);
    let deadline = Duration::from_millis(30);

    let hidden_chain = SelectorChain::new(css("#jobs"), vec![]);
    assert!(resolver.resolve(&hidden_chain, deadline).await.is_err());

    let send_chain = SelectorChain::new(css("#send"), vec![]);
    assert!(resolver.resolve(&send_chain, deadline).await.is_err());

    // links do not need to be enabled to be followed
    let docs_chain = SelectorChain::new(css("#docs"), vec![]);
    assert!(resolver.resolve(&docs_chain, deadline).await.is_ok());
}

#[tokio::test]
async fn fallback_match_reports_its_rank() {
    let link = FakeElement::new("a", "Jobs", &[("href", "/jobs")]);
    let chain = SelectorChain::new(css("nav .jobs"), vec![css("#gone"), chain_of(&link).primary]);
    let page = FakePage::new(Screen::new(HOME_URL, "Example", "", vec![link]));
    let resolver = SelectorResolver::new(&page, fast_config().resolver);

    let target = resolver.resolve(&chain, Duration::from_millis(30)).await.unwrap();

    assert_eq!(target.rank, 2);
    assert_eq!(target.role(), "link");
}

fn nav_links(extra: &[(&str, &str)]) -> (FakeElement, FakeElement) {
    let mut home_attrs = vec![("href", "/home"), ("class", "nav-link")];
    let mut jobs_attrs = vec![("href", "/jobs"), ("class", "nav-link")];
    home_attrs.extend_from_slice(extra);
    jobs_attrs.extend_from_slice(extra);
    (FakeElement::new("a", "Home", &home_attrs), FakeElement::new("a", "Jobs", &jobs_attrs))
}

#[tokio::test]
async fn shared_class_resolves_to_the_snapshot_element() {
    let (home, jobs) = nav_links(&[]);
    let chain = chain_of(&jobs);
    let page = FakePage::new(Screen::new(HOME_URL, "Example", "", vec![home, jobs]));
    let resolver = SelectorResolver::new(&page, fast_config().resolver);

    let target = resolver.resolve_default(&chain).await.unwrap();

    assert_eq!(target.rank, 0);
    assert_eq!(target.state.text, "Jobs");
    assert_eq!(
        target.descriptor,
        Descriptor::Class { tag: "a".into(), class: "nav-link".into(), text: Some("Jobs".into()) }
    );
}

#[tokio::test]
async fn repeated_test_id_moves_past_the_wrong_element() {
    let (home, jobs) = nav_links(&[("data-testid", "nav-item")]);
    let chain = chain_of(&jobs);
    assert!(matches!(chain.primary, Descriptor::TestId { .. }));
    let page = FakePage::new(Screen::new(HOME_URL, "Example", "", vec![home, jobs]));
    let resolver = SelectorResolver::new(&page, fast_config().resolver);

    let target = resolver.resolve_default(&chain).await.unwrap();

    assert_eq!(target.rank, 1);
    assert_eq!(target.state.text, "Jobs");
    // the wrong element is recognised at once, not polled until the deadline
    let primary_queries = page.queries().iter().filter(|q| **q == chain.primary).count();
    assert_eq!(primary_queries, 1);
}
