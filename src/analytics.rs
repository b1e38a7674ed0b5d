//! Read-side statistics for the staff dashboard.
//!
//! The histogram and rollup helpers are pure so they can be checked without a
//! store; [`dashboard`], [`refresh`] and [`export_csv`] compose them over an
//! [`AnalyticsRepo`](crate::repo::AnalyticsRepo). All days and hours are UTC.

use std::collections::HashMap;
use std::io;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::models::{category_label, Category, Id, Question};
use crate::repo::{
    AnalyticsRepo, CategoryQuery, CategoryRepo, CategoryVotes, DayCount, HourCount, QuestionQuery, QuestionRepo, Repo,
    RepoError, TrendingQuestion, VoteFilter,
};

pub const DEFAULT_WINDOW_DAYS: i64 = 30;
pub const MAX_WINDOW_DAYS: i64 = 365;
pub const TRENDING_LIMIT: usize = 10;
pub const ACTIVE_USER_DAYS: i64 = 7;

pub const EXPORT_HEADER: [&str; 8] =
    ["Question", "Category", "Option A", "Option B", "Votes A", "Votes B", "Total Votes", "Created"];

/// Round to one decimal place.
pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// `part / total` as a percentage with one decimal, `0.0` for an empty total.
pub fn percentage(part: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round1(part as f64 / total as f64 * 100.0)
}

/// Chart series: parallel label and count vectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct Series {
    pub labels: Vec<String>,
    pub votes: Vec<i64>,
}

impl Series {
    pub fn total(&self) -> i64 {
        self.votes.iter().sum()
    }
}

/// One bucket per day from `today - days` to `today` inclusive, oldest first.
pub fn daily_histogram(today: NaiveDate, days: i64, counts: &[DayCount]) -> Series {
    let by_day: HashMap<NaiveDate, i64> = counts.iter().map(|c| (c.day, c.votes)).collect();
    let mut series = Series::default();
    let mut day = today - Duration::days(days.max(0));
    while day <= today {
        series.labels.push(day.format("%b %d").to_string());
        series.votes.push(by_day.get(&day).copied().unwrap_or(0));
        day = day + Duration::days(1);
    }
    series
}

/// 24 buckets, `00:00` through `23:00`.
pub fn hourly_histogram(counts: &[HourCount]) -> Series {
    let mut votes = vec![0i64; 24];
    for c in counts {
        if let Some(slot) = usize::try_from(c.hour).ok().and_then(|h| votes.get_mut(h)) {
            *slot += c.votes;
        }
    }
    Series {
        labels: (0..24).map(|h| format!("{h:02}:00")).collect(),
        votes,
    }
}

/// Vote distribution across categories, most voted first.
pub fn category_series(rows: &[CategoryVotes]) -> Series {
    let mut rows = rows.to_vec();
    rows.sort_by(|a, b| b.votes.cmp(&a.votes));
    Series {
        labels: rows.iter().map(|r| category_label(&r.icon, &r.name)).collect(),
        votes: rows.iter().map(|r| r.votes).collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CategoryStats {
    pub id: Id,
    pub name: String,
    pub icon: String,
    pub question_count: i64,
    pub total_votes: i64,
    pub avg_votes: f64,
    /// Share of all votes cast in this category.
    pub engagement_rate: f64,
}

pub fn category_stats(category: &Category, question_count: i64, votes: i64, total_votes: i64) -> CategoryStats {
    let avg_votes = if question_count > 0 { round1(votes as f64 / question_count as f64) } else { 0.0 };
    CategoryStats {
        id: category.id,
        name: category.name.clone(),
        icon: category.icon.clone(),
        question_count,
        total_votes: votes,
        avg_votes,
        engagement_rate: percentage(votes, total_votes),
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChartData {
    pub activity_data: Series,
    pub category_data: Series,
    pub hourly_data: Series,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Dashboard {
    pub total_questions: i64,
    pub total_votes: i64,
    pub today_votes: i64,
    pub active_users: i64,
    pub categories: Vec<Category>,
    pub category_stats: Vec<CategoryStats>,
    pub trending_questions: Vec<TrendingQuestion>,
    #[serde(flatten)]
    pub charts: ChartData,
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(now)
}

/// Chart series over the last `days` days, optionally restricted to one category.
///
/// The category distribution is always global.
pub async fn chart_data(repo: &dyn Repo, now: DateTime<Utc>, days: i64, category_id: Option<Id>) -> Result<ChartData, RepoError> {
    let today = now.date_naive();
    let start = today - Duration::days(days);
    let daily = repo.daily_vote_counts(start, today, category_id).await?;
    let hourly = repo.hourly_vote_counts(category_id).await?;
    let per_category = repo.votes_by_category().await?;
    Ok(ChartData {
        activity_data: daily_histogram(today, days, &daily),
        category_data: category_series(&per_category),
        hourly_data: hourly_histogram(&hourly),
    })
}

#[derive(thiserror::Error, Debug)]
pub enum RefreshError {
    #[error("time_period must be between 1 and {MAX_WINDOW_DAYS} days")]
    Period(i64),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Recompute the charts for a staff-selected window and category.
pub async fn refresh(repo: &dyn Repo, now: DateTime<Utc>, time_period: i64, category_id: Option<Id>) -> Result<ChartData, RefreshError> {
    if !(1..=MAX_WINDOW_DAYS).contains(&time_period) {
        return Err(RefreshError::Period(time_period));
    }
    Ok(chart_data(repo, now, time_period, category_id).await?)
}

pub async fn dashboard(repo: &dyn Repo, now: DateTime<Utc>) -> Result<Dashboard, RepoError> {
    let questions = repo.list_questions(&QuestionQuery::active()).await?;
    let total_votes = repo.count_votes(VoteFilter::default()).await?;
    let today_votes = repo
        .count_votes(VoteFilter { since: Some(start_of_day(now)), category_id: None })
        .await?;
    let active_users = repo.count_active_voters(now - Duration::days(ACTIVE_USER_DAYS)).await?;

    let categories = repo.list_categories(&CategoryQuery::active()).await?;
    let mut stats = Vec::with_capacity(categories.len());
    for category in &categories {
        let question_count = questions.iter().filter(|q| q.category_id == category.id).count() as i64;
        let votes = repo
            .count_votes(VoteFilter { since: None, category_id: Some(category.id) })
            .await?;
        stats.push(category_stats(category, question_count, votes, total_votes));
    }

    let trending_questions = repo.trending_questions(now - Duration::days(1), TRENDING_LIMIT).await?;
    let charts = chart_data(repo, now, DEFAULT_WINDOW_DAYS, None).await?;

    Ok(Dashboard {
        total_questions: questions.len() as i64,
        total_votes,
        today_votes,
        active_users,
        categories,
        category_stats: stats,
        trending_questions,
        charts,
    })
}

#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Write one CSV row per question. Questions whose category is unknown get an empty category cell.
pub fn write_csv<W: io::Write>(out: W, questions: &[Question], categories: &[Category]) -> Result<W, csv::Error> {
    let names: HashMap<Id, &str> = categories.iter().map(|c| (c.id, c.name.as_str())).collect();
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(EXPORT_HEADER)?;
    for q in questions {
        let tally = q.tally();
        wtr.write_record([
            q.title(),
            names.get(&q.category_id).copied().unwrap_or_default().to_string(),
            q.option_a.clone(),
            q.option_b.clone(),
            q.votes_a.to_string(),
            q.votes_b.to_string(),
            tally.total().to_string(),
            q.created_at.format("%Y-%m-%d").to_string(),
        ])?;
    }
    wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))
}

pub async fn export_csv(repo: &dyn Repo) -> Result<Vec<u8>, ExportError> {
    let questions = repo.list_questions(&QuestionQuery::default()).await?;
    let categories = repo.list_categories(&CategoryQuery::default()).await?;
    Ok(write_csv(Vec::new(), &questions, &categories)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn category(id: Id, name: &str) -> Category {
        Category {
            id,
            name: name.into(),
            icon: "🍕".into(),
            description: String::new(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn percentage_rounds_and_handles_zero() {
        assert_eq!(percentage(1, 3), 33.3);
        assert_eq!(percentage(2, 3), 66.7);
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(percentage(0, 9), 0.0);
    }

    #[test]
    fn daily_histogram_zero_fills_window() {
        let today = date(2024, 3, 10);
        let counts = vec![
            DayCount { day: date(2024, 3, 8), votes: 4 },
            DayCount { day: date(2024, 3, 10), votes: 2 },
        ];
        let s = daily_histogram(today, 3, &counts);
        assert_eq!(s.labels, vec!["Mar 07", "Mar 08", "Mar 09", "Mar 10"]);
        assert_eq!(s.votes, vec![0, 4, 0, 2]);
        assert_eq!(s.total(), 6);
    }

    #[test]
    fn daily_histogram_spans_month_boundary() {
        let s = daily_histogram(date(2024, 3, 1), 30, &[]);
        assert_eq!(s.labels.len(), 31);
        assert_eq!(s.labels.first().map(String::as_str), Some("Jan 31"));
        assert_eq!(s.labels.last().map(String::as_str), Some("Mar 01"));
        assert!(s.votes.iter().all(|v| *v == 0));
    }

    #[test]
    fn hourly_histogram_has_24_ordered_buckets() {
        let s = hourly_histogram(&[HourCount { hour: 0, votes: 1 }, HourCount { hour: 23, votes: 5 }, HourCount { hour: 13, votes: 2 }]);
        assert_eq!(s.labels.len(), 24);
        assert_eq!(s.labels[0], "00:00");
        assert_eq!(s.labels[23], "23:00");
        assert_eq!(s.votes[0], 1);
        assert_eq!(s.votes[13], 2);
        assert_eq!(s.votes[23], 5);
        assert_eq!(s.total(), 8);
    }

    #[test]
    fn hourly_histogram_ignores_out_of_range_hours() {
        let s = hourly_histogram(&[HourCount { hour: 24, votes: 3 }, HourCount { hour: -1, votes: 3 }]);
        assert_eq!(s.total(), 0);
    }

    #[test]
    fn category_series_orders_by_votes() {
        let rows = vec![
            CategoryVotes { category_id: 1, name: "Food".into(), icon: "🍕".into(), votes: 2 },
            CategoryVotes { category_id: 2, name: "Pets".into(), icon: "🐶".into(), votes: 9 },
        ];
        let s = category_series(&rows);
        assert_eq!(s.labels, vec!["🐶 Pets", "🍕 Food"]);
        assert_eq!(s.votes, vec![9, 2]);
    }

    #[test]
    fn category_stats_rollup() {
        let c = category(1, "Food");
        let s = category_stats(&c, 3, 10, 40);
        assert_eq!(s.avg_votes, 3.3);
        assert_eq!(s.engagement_rate, 25.0);

        let empty = category_stats(&c, 0, 0, 0);
        assert_eq!(empty.avg_votes, 0.0);
        assert_eq!(empty.engagement_rate, 0.0);
    }

    #[test]
    fn csv_export_layout() {
        let created = Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap();
        let q = Question {
            id: 7,
            category_id: 1,
            option_a: "Tea".into(),
            option_b: "Coffee, black".into(),
            option_a_image: None,
            option_b_image: None,
            votes_a: 3,
            votes_b: 1,
            is_active: true,
            featured: false,
            created_at: created,
        };
        let bytes = write_csv(Vec::new(), &[q], &[category(1, "Drinks")]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Question,Category,Option A,Option B,Votes A,Votes B,Total Votes,Created"));
        assert_eq!(lines.next(), Some("\"Tea vs Coffee, black\",Drinks,Tea,\"Coffee, black\",3,1,4,2024-05-17"));
        assert_eq!(lines.next(), None);
    }
}
