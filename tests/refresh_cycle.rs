mod common;

use common::{completed, Harness};
use repo_fleet::golden::AddRepoRequest;

async fn add(h: &Harness, alias: &str, write_exception: bool) {
    let url = format!("remote://{}", alias);
    h.git.set_branch(&url, "main", &[("a.txt", "a\n")]);
    let mut req = AddRepoRequest::new(url, alias);
    req.write_exception = write_exception;
    completed(&h.fleet, h.fleet.add_golden(req).await).await;
}

#[tokio::test]
async fn test_cycle_refreshes_due_repositories_and_skips_leased() {
    let h = Harness::with_config(|c| c.refresh.lease_warn_secs = 0).await;
    add(&h, "open", false).await;
    add(&h, "edited", true).await;
    h.fleet.enter_write_mode("edited").await.unwrap();

    h.git.block_fetch();
    let report = h.fleet.run_refresh_cycle().await.unwrap();
    assert_eq!(report.submitted.len(), 1);
    assert_eq!(report.submitted[0].0, "open");
    assert_eq!(report.leased, vec!["edited"]);
    assert_eq!(report.starved, vec!["edited"]);

    // The first refresh still holds "open".
    let again = h.fleet.run_refresh_cycle().await.unwrap();
    assert!(again.submitted.is_empty());
    assert_eq!(again.busy, vec!["open"]);

    h.git.unblock_fetch();
    let job = h.fleet.wait_job(&report.submitted[0].1).await.unwrap();
    assert_eq!(job.status, repo_fleet::models::JobStatus::Completed);
}

#[tokio::test]
async fn test_recently_refreshed_repositories_are_not_due() {
    let h = Harness::with_config(|c| c.refresh.interval_secs = 3600).await;
    add(&h, "fresh", false).await;

    let report = h.fleet.run_refresh_cycle().await.unwrap();
    assert!(report.submitted.is_empty());
    assert!(report.busy.is_empty());
}
