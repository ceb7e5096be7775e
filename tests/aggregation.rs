mod common;

use common::{completed, Harness};
use repo_fleet::aggregate::{AggregationMode, AggregationRequest, QueryOperation};
use repo_fleet::backend::IndexKind;
use repo_fleet::cache::CacheLookup;
use repo_fleet::error::ErrorKind;
use repo_fleet::golden::AddRepoRequest;
use repo_fleet::selector::RepoSelector;

fn request(repos: RepoSelector, text: &str) -> AggregationRequest {
    AggregationRequest {
        repos,
        mode: AggregationMode::Global,
        limit: None,
        query: text.to_string(),
        operation: QueryOperation::Search,
        kind: None,
        owner: None,
    }
}

fn list(aliases: &[&str]) -> RepoSelector {
    RepoSelector::List(aliases.iter().map(|a| a.to_string()).collect())
}

/// Adds `alias` with `files` generated files, each mentioning "deploy".
async fn add_repo(h: &Harness, alias: &str, files: usize) {
    let url = format!("remote://{}", alias);
    let contents: Vec<(String, String)> = (0..files)
        .map(|i| (format!("f{:02}.txt", i), format!("deploy step {}\n", i)))
        .collect();
    let borrowed: Vec<(&str, &str)> = contents
        .iter()
        .map(|(p, c)| (p.as_str(), c.as_str()))
        .collect();
    h.git.set_branch(&url, "main", &borrowed);
    completed(&h.fleet, h.fleet.add_golden(AddRepoRequest::new(url, alias)).await).await;
}

#[tokio::test]
async fn test_pattern_selector_queries_matching_repositories() {
    let h = Harness::new().await;
    add_repo(&h, "team-a-global", 2).await;
    add_repo(&h, "team-b-global", 2).await;
    add_repo(&h, "team-b-local", 2).await;

    let response = h
        .fleet
        .query(request(RepoSelector::One("team-*-global".into()), "deploy"))
        .await
        .unwrap();
    assert_eq!(response.repos_queried, vec!["team-a-global", "team-b-global"]);
    assert_eq!(response.total_results, 4);
    assert!(response.results.iter().all(|r| r.repo != "team-b-local"));

    let err = h
        .fleet
        .query(request(RepoSelector::One("nobody-*".into()), "deploy"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_unknown_single_alias_is_not_found() {
    let h = Harness::new().await;
    add_repo(&h, "alpha", 1).await;

    let err = h
        .fleet
        .query(request(RepoSelector::One("ghost".into()), "deploy"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_partial_failure_reports_each_failed_repository() {
    let h = Harness::new().await;
    add_repo(&h, "alpha", 2).await;
    add_repo(&h, "beta", 2).await;
    completed(&h.fleet, h.fleet.add_index("beta", IndexKind::Semantic).await).await;

    let mut req = request(list(&["alpha", "beta", "ghost"]), "deploy");
    req.kind = Some(IndexKind::Semantic);
    let response = h.fleet.query(req).await.unwrap();

    assert!(response.success);
    assert!(response.partial_failure);
    assert_eq!(response.total_results, 2);
    assert!(response.results.iter().all(|r| r.repo == "beta"));
    assert_eq!(response.errors.len(), 2);
    assert!(response.errors["alpha"].contains("no semantic index"));
    assert!(response.errors.contains_key("ghost"));
}

#[tokio::test]
async fn test_unhealthy_index_fails_only_that_repository() {
    let h = Harness::new().await;
    add_repo(&h, "alpha", 1).await;
    add_repo(&h, "beta", 1).await;

    let snapshot = h.fleet.get_golden("beta").await.unwrap().snapshot.unwrap();
    std::fs::remove_dir_all(snapshot.path.join(".fleet-index")).unwrap();

    let response = h
        .fleet
        .query(request(list(&["alpha", "beta"]), "deploy"))
        .await
        .unwrap();
    assert!(response.partial_failure);
    assert_eq!(response.total_results, 1);
    assert!(response.errors["beta"].contains("unhealthy"));
}

#[tokio::test]
async fn test_global_mode_ranks_across_repositories() {
    let h = Harness::new().await;
    h.git.set_branch(
        "remote://loud",
        "main",
        &[("ops.md", "deploy\ndeploy again\ndeploy once more\n")],
    );
    completed(
        &h.fleet,
        h.fleet
            .add_golden(AddRepoRequest::new("remote://loud", "loud"))
            .await,
    )
    .await;
    add_repo(&h, "quiet", 3).await;

    let mut req = request(list(&["quiet", "loud"]), "deploy");
    req.limit = Some(2);
    let response = h.fleet.query(req).await.unwrap();
    assert_eq!(response.total_results, 2);
    assert_eq!(response.results[0].repo, "loud");
    assert_eq!(response.results[0].score, 3.0);
    assert_eq!(response.results[1].repo, "quiet");
}

#[tokio::test]
async fn test_per_repo_mode_splits_limit_evenly() {
    let h = Harness::new().await;
    add_repo(&h, "a", 5).await;
    add_repo(&h, "b", 1).await;
    add_repo(&h, "c", 5).await;

    let mut req = request(list(&["a", "b", "c"]), "deploy");
    req.mode = AggregationMode::PerRepo;
    req.limit = Some(6);
    let response = h.fleet.query(req).await.unwrap();

    let count = |repo: &str| response.results.iter().filter(|r| r.repo == repo).count();
    assert_eq!(response.total_results, 6);
    assert_eq!((count("a"), count("b"), count("c")), (3, 1, 2));

    // Grouped in selector order.
    let order: Vec<&str> = response.results.iter().map(|r| r.repo.as_str()).collect();
    assert_eq!(order, vec!["a", "a", "a", "b", "c", "c"]);
}

#[tokio::test]
async fn test_limit_and_query_validation() {
    let h = Harness::new().await;
    add_repo(&h, "alpha", 1).await;
    let max = h.fleet.config().aggregation.max_limit;

    for limit in [0, max + 1] {
        let mut req = request(RepoSelector::One("alpha".into()), "deploy");
        req.limit = Some(limit);
        let err = h.fleet.query(req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    let err = h
        .fleet
        .query(request(RepoSelector::One("alpha".into()), "   "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let err = h
        .fleet
        .query(request(RepoSelector::List(Vec::new()), "deploy"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}

#[tokio::test]
async fn test_list_files_applies_glob() {
    let h = Harness::new().await;
    h.git.set_branch(
        "remote://svc",
        "main",
        &[
            ("src/main.rs", "fn main() {}\n"),
            ("src/util.rs", "fn util() {}\n"),
            ("README.md", "svc\n"),
        ],
    );
    completed(
        &h.fleet,
        h.fleet
            .add_golden(AddRepoRequest::new("remote://svc", "svc"))
            .await,
    )
    .await;

    let mut req = request(RepoSelector::One("svc".into()), "src/*.rs");
    req.operation = QueryOperation::ListFiles;
    let response = h.fleet.query(req).await.unwrap();
    let paths: Vec<&str> = response.results.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["src/main.rs", "src/util.rs"]);

    let mut req = request(RepoSelector::One("svc".into()), "");
    req.operation = QueryOperation::ListFiles;
    let response = h.fleet.query(req).await.unwrap();
    assert_eq!(response.total_results, 3);
}

#[tokio::test]
async fn test_large_content_is_returned_through_cache_handle() {
    let h = Harness::with_config(|c| {
        c.cache.inline_threshold = 64;
        c.cache.page_size = 40;
        c.cache.preview_chars = 12;
    })
    .await;
    let long_line = format!("deploy {}\n", "x".repeat(150));
    h.git
        .set_branch("remote://big", "main", &[("big.txt", long_line.as_str())]);
    completed(
        &h.fleet,
        h.fleet
            .add_golden(AddRepoRequest::new("remote://big", "big"))
            .await,
    )
    .await;

    let response = h
        .fleet
        .query(request(RepoSelector::One("big".into()), "deploy"))
        .await
        .unwrap();
    let item = &response.results[0];
    assert_eq!(item.content.chars().count(), 12);
    let handle = item.cache_handle.clone().unwrap();

    let CacheLookup::Page(first) = h.fleet.cache_page(&handle, 1).unwrap() else {
        panic!("handle should be live");
    };
    assert!(first.has_more);
    assert!(first.content.starts_with(&item.content));

    let mut full = first.content.clone();
    for page in 2..=first.total_pages {
        let CacheLookup::Page(p) = h.fleet.cache_page(&handle, page).unwrap() else {
            panic!("page {} missing", page);
        };
        full.push_str(&p.content);
    }
    assert_eq!(full, format!("1: {}", long_line.trim_end()));

    let err = h
        .fleet
        .cache_page(&handle, first.total_pages + 1)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(
        h.fleet.cache_page("no-such-handle", 1).unwrap(),
        CacheLookup::NotFound
    );
}

#[tokio::test]
async fn test_small_content_stays_inline() {
    let h = Harness::new().await;
    add_repo(&h, "alpha", 1).await;

    let response = h
        .fleet
        .query(request(RepoSelector::One("alpha".into()), "deploy"))
        .await
        .unwrap();
    assert_eq!(response.results[0].content, "1: deploy step 0");
    assert!(response.results[0].cache_handle.is_none());
}
