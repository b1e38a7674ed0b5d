use crate::analytics::{CategoryStats, ChartData, Dashboard, Series};
use crate::config::SiteConfig;
use crate::models::{
    Category, NewCategory, NewPoll, NewQuestion, Poll, PollChoice, PollDetail, Question, Tally, UpdateCategory,
    UpdateQuestion, Vote, VoteChoice, VoteResults, WinningOption,
};
use crate::repo::TrendingQuestion;
use crate::voting::{CategoryOverview, QuestionSummary, QuizSummary};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::vote,
        crate::routes::home,
        crate::routes::play,
        crate::routes::quiz_summary,
        crate::routes::analytics_dashboard,
        crate::routes::analytics_update,
        crate::routes::analytics_export,
        crate::routes::list_polls,
        crate::routes::poll_detail,
        crate::routes::poll_results,
        crate::routes::vote_poll,
        crate::routes::admin_site,
        crate::routes::admin_list_categories,
        crate::routes::admin_create_category,
        crate::routes::admin_get_category,
        crate::routes::admin_update_category,
        crate::routes::admin_delete_category,
        crate::routes::admin_list_questions,
        crate::routes::admin_create_question,
        crate::routes::admin_get_question,
        crate::routes::admin_update_question,
        crate::routes::admin_delete_question,
        crate::routes::admin_list_votes,
        crate::routes::admin_list_polls,
        crate::routes::admin_create_poll,
        crate::routes::admin_delete_poll,
    ),
    components(schemas(
        Category, NewCategory, UpdateCategory, Question, NewQuestion, UpdateQuestion,
        Vote, VoteChoice, VoteResults, WinningOption, Tally,
        Poll, PollChoice, PollDetail, NewPoll,
        CategoryOverview, QuestionSummary, QuizSummary, TrendingQuestion,
        Series, CategoryStats, ChartData, Dashboard, SiteConfig,
        crate::routes::HomePage, crate::routes::ChartRefresh, crate::routes::AdminCategory,
        crate::routes::AdminQuestion, crate::routes::AdminPoll
    )),
    tags(
        (name = "this-or-that", description = "Voting game"),
        (name = "analytics", description = "Staff dashboard"),
        (name = "polls", description = "Legacy polls"),
        (name = "admin", description = "Content administration"),
    )
)]
pub struct ApiDoc;
