mod budget;
mod compositor;
mod templates;

pub use budget::{
    check_budget, check_budget_against, estimate_tokens, BudgetStatus, PromptBudget,
    TEXT_ENCODER_TOKEN_LIMIT,
};
pub use compositor::{
    compose, compose_for_request, compose_with, detect_context_rule, ComposedPrompt, ContextRule,
    PromptContext, FRAGMENT_SEPARATOR,
};
pub use templates::{all_templates, template_for, PromptTemplate, ANATOMICAL_DEFECTS};
