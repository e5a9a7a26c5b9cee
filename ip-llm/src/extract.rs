use crate::types::{ChatResponse, FunctionCall};

/// Returns the first function call of the first choice, if the model asked for one.
pub fn first_function_call(response: &ChatResponse) -> Option<&FunctionCall> {
    let choice = response.choices.first()?;
    choice.message.tool_calls.first().map(|tc| &tc.function)
}
