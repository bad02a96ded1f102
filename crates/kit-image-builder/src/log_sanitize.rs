//! Make subprocess output safe to echo: tools like `dpkg`, `xz -v` and `docker`
//! emit ANSI colour, cursor movement and progress redraws.

const MAX_LOG_CHARS: usize = 4096;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Escape,
    // CSI: ESC [ params final-byte
    Csi,
    // OSC / DCS style strings, terminated by BEL or ESC \
    Str { bel_ends: bool },
    StrEscape { bel_ends: bool },
}

pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut state = State::Text;
    let mut kept = 0usize;

    for c in input.chars() {
        state = match state {
            State::Text => {
                match c {
                    '\x1b' => State::Escape,
                    '\t' => {
                        out.push(' ');
                        kept += 1;
                        State::Text
                    }
                    c if c.is_control() || is_bidi_control(c) => State::Text,
                    c => {
                        out.push(c);
                        kept += 1;
                        State::Text
                    }
                }
            }
            State::Escape => match c {
                '[' => State::Csi,
                ']' => State::Str { bel_ends: true },
                'P' | 'X' | '^' | '_' => State::Str { bel_ends: false },
                _ => State::Text,
            },
            State::Csi if ('@'..='~').contains(&c) => State::Text,
            State::Csi => State::Csi,
            State::Str { bel_ends } => match c {
                '\x07' if bel_ends => State::Text,
                '\x1b' => State::StrEscape { bel_ends },
                _ => State::Str { bel_ends },
            },
            State::StrEscape { bel_ends } => match c {
                '\\' => State::Text,
                '\x1b' => State::StrEscape { bel_ends },
                _ => State::Str { bel_ends },
            },
        };

        if kept >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
