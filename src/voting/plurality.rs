use crate::models::Poll;
use crate::voting::{PollResults, VoteCount};

pub fn calculate_results(poll: &Poll) -> PollResults {
    let mut ranked: Vec<VoteCount> = poll
        .options
        .iter()
        .enumerate()
        .map(|(option_index, option)| VoteCount {
            option_index,
            text: option.text.clone(),
            votes: option.votes,
        })
        .collect();

    // Stable sort keeps earlier options ahead on a tie
    ranked.sort_by(|a, b| b.votes.cmp(&a.votes));

    let total_votes = poll.total_votes();

    // If no votes were cast there is no winner
    let winner = if total_votes == 0 {
        None
    } else {
        ranked.first().cloned()
    };

    PollResults {
        winner,
        total_votes,
        ranked,
    }
}
