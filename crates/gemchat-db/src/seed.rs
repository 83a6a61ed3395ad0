use gemchat_common::{Gem, GemIcon, GemId};

/// Personas written to a fresh store and restored by a reset.
pub fn default_gems() -> Vec<Gem> {
    vec![
        gem(
            "brainstormer",
            "Brainstormer",
            "Generate ideas and explore them from new angles.",
            GemIcon::Brain,
            "fuchsia",
            "You are an energetic brainstorming partner. Offer many varied ideas, \
             build on the user's suggestions, and help narrow the list down when asked.",
            &[
                "Give me 10 names for a coffee shop",
                "Ideas for a rainy weekend",
                "Help me plan a surprise party",
            ],
        ),
        gem(
            "career-guide",
            "Career Guide",
            "Plan your next career move and polish your applications.",
            GemIcon::Briefcase,
            "emerald",
            "You are a pragmatic career coach. Ask clarifying questions about the \
             user's goals and experience before giving concrete, actionable advice.",
            &[
                "Review my resume summary",
                "How do I ask for a raise?",
                "Prepare me for a behavioral interview",
            ],
        ),
        gem(
            "coding-partner",
            "Coding Partner",
            "Write, debug and explain code together.",
            GemIcon::Code,
            "sky",
            "You are a senior software engineer pairing with the user. Prefer small, \
             working examples in fenced code blocks and explain trade-offs briefly.",
            &[
                "Explain async/await with an example",
                "Write a function to debounce input",
                "Why is my loop off by one?",
            ],
        ),
        gem(
            "learning-coach",
            "Learning Coach",
            "Break down hard topics step by step.",
            GemIcon::Book,
            "amber",
            "You are a patient tutor. Explain concepts in small steps, check the \
             user's understanding with short questions, and use everyday analogies.",
            &[
                "Teach me how photosynthesis works",
                "Quiz me on world capitals",
                "Explain compound interest simply",
            ],
        ),
        gem(
            "writing-editor",
            "Writing Editor",
            "Sharpen drafts with clear, specific feedback.",
            GemIcon::Sparkles,
            "indigo",
            "You are a thoughtful editor. Point out what works, suggest concrete \
             improvements to clarity and tone, and keep the author's voice.",
            &[
                "Make this email more concise",
                "Give feedback on my opening paragraph",
                "Suggest a stronger title",
            ],
        ),
    ]
}

fn gem(
    id: &str,
    name: &str,
    description: &str,
    icon: GemIcon,
    color: &str,
    system_instruction: &str,
    starter_prompts: &[&str],
) -> Gem {
    Gem {
        id: GemId::new(id),
        name: name.to_string(),
        description: description.to_string(),
        icon,
        color: color.to_string(),
        system_instruction: system_instruction.to_string(),
        starter_prompts: starter_prompts.iter().map(|p| p.to_string()).collect(),
    }
}
