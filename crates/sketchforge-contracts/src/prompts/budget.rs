use serde::Serialize;

/// Token window of the CLIP text encoder most backends share.
pub const TEXT_ENCODER_TOKEN_LIMIT: usize = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Ok,
    NearLimit,
    OverLimit,
}

impl BudgetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetStatus::Ok => "ok",
            BudgetStatus::NearLimit => "near_limit",
            BudgetStatus::OverLimit => "over_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PromptBudget {
    pub estimated_tokens: usize,
    pub limit: usize,
    pub status: BudgetStatus,
}

impl PromptBudget {
    pub fn needs_warning(&self) -> bool {
        self.status != BudgetStatus::Ok
    }
}

/// Rough estimate: one token per word plus one per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count() + text.chars().count() / 4
}

/// Diagnostic only. Prompts are never truncated to fit.
pub fn check_budget(text: &str) -> PromptBudget {
    check_budget_against(text, TEXT_ENCODER_TOKEN_LIMIT)
}

pub fn check_budget_against(text: &str, limit: usize) -> PromptBudget {
    let estimated_tokens = estimate_tokens(text);
    let status = if estimated_tokens > limit {
        BudgetStatus::OverLimit
    } else if estimated_tokens * 5 > limit * 4 {
        BudgetStatus::NearLimit
    } else {
        BudgetStatus::Ok
    };
    PromptBudget {
        estimated_tokens,
        limit,
        status,
    }
}
